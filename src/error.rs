use std::io;

/// The error taxonomy for `loomnet`'s public API (see spec §7).
///
/// Transport-level failures that the runtime reports to the *application*
/// (read errors surfaced as `on_closed(Some(err))`, dial failures surfaced as
/// `on_connect_failed`) are plain [`std::io::Error`] values, not this type —
/// `Error` is reserved for failures returned synchronously to the caller of a
/// core API (`listen`, `connect`, registry inserts, ...).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("service key {key:?} is already registered")]
    DuplicateService { key: String },

    #[error("service {key:?} is not registered")]
    ServiceNotFound { key: String },

    #[error("session id {id} is already present in this group")]
    DuplicateSession { id: u64 },

    #[error("invalid service url {url:?}: {reason}")]
    InvalidAddress { url: String, reason: String },

    #[error("reuseport is not available on this platform/network ({network})")]
    ReusePortUnavailable { network: String },

    #[error("network module is not running")]
    ModuleNotRunning,

    #[error("network module is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
