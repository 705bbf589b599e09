//! Error types.
//!
//! [`ForwardError`] is scoped to a single query: nothing in it is fatal to
//! the process. [`Error`] covers startup failures of the binary.

use std::fmt::Write as _;
use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Failure of one DNS exchange or one forwarding attempt.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The query context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The query context was cancelled by its owner.
    #[error("context canceled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A from-socket could not be created for `key`.
    #[error("failed to bind from-socket for {key}: {source}")]
    Bind {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed DNS message: {0}")]
    Codec(&'static str),

    /// Every transaction id towards one upstream is in flight on a from-socket.
    #[error("no free transaction id on from-socket")]
    TransactionIdsExhausted,

    /// The from-socket's reader stopped before a reply arrived.
    #[error("from-socket reader closed")]
    ReaderClosed,

    /// Several errors observed by one operation, in the order they happened.
    #[error("{}", join_messages(.0))]
    Joined(Vec<ForwardError>),
}

impl ForwardError {
    /// Whether this error comes from the query context rather than the network.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::Cancelled)
    }
}

fn join_messages(errors: &[ForwardError]) -> String {
    let mut out = String::new();
    for (i, e) in errors.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{e}");
    }
    out
}

/// Startup failures of the proxy.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
