//! sandboxd box lifecycle and execution library.
//!
//! This crate provides the backend-agnostic control plane for sandbox boxes:
//! the backend port with its daemon and cluster realizations, the exec
//! engine, the access tracker, the reclaim loop, and the image manager, all
//! tied together by the [`service::BoxService`] facade.

pub mod backend;
pub mod config;
pub mod images;
pub mod service;
pub mod stream;

mod util;

pub use backend::types::{
    BoxConfig, BoxFile, BoxFilter, BoxInfo, BoxKind, BoxStatus, CodeLanguage, CreateBoxParams,
    ExecOutput, ExecParams, FileKind, ImageAction, ImageReport, ImageUpdateParams,
    ImageUpdateReport, InteractiveExecParams, InteractiveOutcome, MountSpec, PathStat,
    ProgressRecord, ProgressSender, ProgressStatus, RunCodeParams, StreamMode,
};
pub use backend::{BackendRegistry, BoxBackend};
pub use config::ServiceConfig;
pub use service::{BoxService, ReclaimReport};

pub use sandboxd_shared::{SandboxError, SandboxResult};
