//! Label schema, media types, and filesystem layout constants.
//!
//! Everything the daemon and cluster backends stamp onto backend-native
//! objects lives here so both sides of the wire agree on the names.

/// Internal label/annotation namespace.
pub const NAMESPACE: &str = "sandboxd";

/// Label keys persisted on every backend object owned by sandboxd.
pub mod labels {
    /// Box id, immutable for the lifetime of the box.
    pub const ID: &str = "sandboxd.id";
    /// Always `box`; listings filter on this to exclude unrelated workloads.
    pub const NAME: &str = "sandboxd.name";
    pub const INSTANCE: &str = "sandboxd.instance";
    pub const NAMESPACE: &str = "sandboxd.namespace";
    pub const VERSION: &str = "sandboxd.version";
    pub const COMPONENT: &str = "sandboxd.component";
    pub const MANAGED_BY: &str = "sandboxd.managed-by";
    pub const BOX_TYPE: &str = "sandboxd.type";
    pub const EXPIRES_IN: &str = "sandboxd.expires_in";

    /// User labels are persisted under this prefix and exposed without it.
    pub const EXTRA_PREFIX: &str = "sandboxd.extra.";

    pub const NAME_VALUE: &str = "box";
    pub const VERSION_VALUE: &str = "v1";
    pub const COMPONENT_VALUE: &str = "sandbox";
    pub const MANAGED_BY_VALUE: &str = "sandboxd";
}

/// Media types negotiated on the interactive command endpoint.
pub mod media {
    /// TTY mode: no framing, one raw byte stream.
    pub const RAW_STREAM: &str = "application/vnd.sandboxd.raw-stream";
    /// Framed mode: 8-byte header then payload, stdout/stderr multiplexed.
    pub const MULTIPLEXED_STREAM: &str = "application/vnd.sandboxd.multiplexed-stream";
    /// Newline-delimited JSON progress streams (create, image update).
    pub const NDJSON: &str = "application/x-ndjson";
    pub const TAR: &str = "application/x-tar";
}

/// Response header carrying `{name,size,mode,mtime}` for archive endpoints.
pub const PATH_STAT_HEADER: &str = "X-Sandboxd-Path-Stat";

/// Default working directory for exec when the caller supplies none.
pub const DEFAULT_WORKING_DIR: &str = "/var/sandboxd";

/// Mount point of the per-box host share inside the box.
pub const SHARE_MOUNT_PATH: &str = "/var/sandboxd/share";

/// Image pulled at startup and used when a create omits the image.
pub const DEFAULT_IMAGE_REPO: &str = "sandboxd/runner";
