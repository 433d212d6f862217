//! Image pull, listing, removal, and the synchronous update-image path.

use std::collections::HashMap;

use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions};
use futures::StreamExt;

use sandboxd_shared::errors::{SandboxError, SandboxResult};

use super::DockerBackend;
use crate::backend::ImageRecord;
use crate::backend::types::{
    ImageAction, ImageReport, ImageUpdateParams, ImageUpdateReport, ProgressRecord, ProgressSender,
};
use crate::util::split_image_ref;

impl DockerBackend {
    pub(crate) async fn pull_image_impl(
        &self,
        reference: &str,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<()> {
        let reference = self.config.normalize_image(reference);
        tracing::info!(image = %reference, "pulling image");

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| {
                SandboxError::Upstream(format!("pulling image {}: {}", reference, e))
            })?;
            if let Some(error) = info.error {
                return Err(SandboxError::Upstream(format!(
                    "pulling image {}: {}",
                    reference, error
                )));
            }
            if let (Some(sink), Some(status)) = (&progress, info.status) {
                let message = match info.progress {
                    Some(detail) => format!("{} {}", status, detail),
                    None => status,
                };
                let _ = sink.send(ProgressRecord::progress(message)).await;
            }
        }

        tracing::info!(image = %reference, "pulled image");
        Ok(())
    }

    pub(crate) async fn list_images_impl(
        &self,
        repository: Option<&str>,
    ) -> SandboxResult<Vec<ImageRecord>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(repo) = repository {
            filters.insert("reference".to_string(), vec![repo.to_string()]);
        }
        let summaries = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::Upstream(format!("listing images: {}", e)))?;

        Ok(summaries
            .into_iter()
            .map(|summary| ImageRecord {
                id: summary.id,
                repo_tags: summary.repo_tags,
            })
            .collect())
    }

    pub(crate) async fn remove_image_impl(&self, reference: &str, force: bool) -> SandboxResult<()> {
        self.docker
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force,
                    noprune: false,
                }),
                None,
            )
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                } => SandboxError::NotFound(message),
                other => SandboxError::Upstream(format!("removing image {}: {}", reference, other)),
            })?;
        tracing::info!(image = %reference, "removed image");
        Ok(())
    }

    async fn image_id(&self, reference: &str) -> Option<String> {
        self.docker
            .inspect_image(reference)
            .await
            .ok()
            .and_then(|inspect| inspect.id)
    }

    /// Synchronous image update, distinct from the background worker.
    ///
    /// Always reports the target's status and every outdated sibling tag of
    /// the same repository; in dry-run mode nothing is pulled or deleted.
    pub(crate) async fn update_image_impl(
        &self,
        params: ImageUpdateParams,
        progress: Option<ProgressSender>,
    ) -> SandboxResult<ImageUpdateReport> {
        let reference = self.config.normalize_image(
            params
                .image_reference
                .as_deref()
                .unwrap_or(sandboxd_shared::constants::DEFAULT_IMAGE_REPO),
        );
        let (repository, _) = split_image_ref(&reference);
        let repository = repository.to_string();

        if let Some(sink) = &progress {
            let _ = sink
                .send(ProgressRecord::prepare(format!("updating {}", reference)))
                .await;
        }

        let before = self.image_id(&reference).await;
        let target = if params.dry_run {
            ImageReport {
                reference: reference.clone(),
                image_id: before.clone(),
                action: if before.is_none() || params.force {
                    ImageAction::WouldPull
                } else {
                    ImageAction::UpToDate
                },
            }
        } else if before.is_none() || params.force {
            if let Err(e) = self.pull_image_impl(&reference, progress.clone()).await {
                if let Some(sink) = &progress {
                    let _ = sink.send(ProgressRecord::error(e.to_string())).await;
                }
                return Err(e);
            }
            let after = self.image_id(&reference).await;
            ImageReport {
                reference: reference.clone(),
                image_id: after.clone(),
                action: if before.is_some() && before == after {
                    ImageAction::UpToDate
                } else {
                    ImageAction::Pulled
                },
            }
        } else {
            ImageReport {
                reference: reference.clone(),
                image_id: before.clone(),
                action: ImageAction::UpToDate,
            }
        };

        // Every other tag of the repository whose image id differs from the
        // target's is outdated.
        let target_id = target.image_id.clone();
        let mut outdated = Vec::new();
        for record in self.list_images_impl(Some(&repository)).await? {
            for tag in &record.repo_tags {
                if *tag == reference || split_image_ref(tag).0 != repository {
                    continue;
                }
                if target_id.as_deref() == Some(record.id.as_str()) {
                    continue;
                }
                let action = if params.dry_run {
                    ImageAction::WouldRemove
                } else {
                    match self.remove_image_impl(tag, false).await {
                        Ok(()) => ImageAction::Removed,
                        Err(e) => {
                            tracing::warn!(image = %tag, error = %e, "failed to remove outdated tag");
                            ImageAction::WouldRemove
                        }
                    }
                };
                outdated.push(ImageReport {
                    reference: tag.clone(),
                    image_id: Some(record.id.clone()),
                    action,
                });
            }
        }

        if let Some(sink) = &progress {
            let _ = sink
                .send(ProgressRecord::complete(
                    format!("{} up to date", reference),
                    target.image_id.clone(),
                ))
                .await;
        }

        Ok(ImageUpdateReport { target, outdated })
    }
}
