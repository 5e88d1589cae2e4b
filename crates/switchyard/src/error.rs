use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::jsonrpc::ErrorObject;

/// The reason attached to an abort.
///
/// A scheduler or correlator can only be aborted *with* a reason; there is no
/// absent sentinel to reject at runtime. Reasons are cheap to clone and are
/// surfaced as-is to callers whose work was cancelled.
#[derive(Clone, PartialEq, Eq)]
pub struct Reason(Arc<str>);

impl Reason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(Arc::from(reason.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Reason {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

impl From<String> for Reason {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

impl PartialEq<&str> for Reason {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reason({:?})", &*self.0)
    }
}

/// Errors surfaced by the core scheduling, gating, and correlation layers.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("aborted: {0}")]
    Aborted(Reason),
    #[error("channel aborted")]
    ChannelAborted,
    #[error("scheduler is destroyed")]
    SchedulerDestroyed,
    #[error("too many queued acquirers")]
    TooManyQueued,
    #[error("token is not ready for work")]
    TokenMisuse,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote error {}: {}", .0.code, .0.message)]
    Rpc(ErrorObject),
    #[error("transport channel closed")]
    ChannelClosed,
}

impl CoreError {
    /// The abort reason carried by this error, if it is an abort.
    pub fn abort_reason(&self) -> Option<&Reason> {
        match self {
            CoreError::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<ErrorObject> for CoreError {
    fn from(error: ErrorObject) -> Self {
        CoreError::Rpc(error)
    }
}

impl From<Reason> for CoreError {
    fn from(reason: Reason) -> Self {
        CoreError::Aborted(reason)
    }
}
