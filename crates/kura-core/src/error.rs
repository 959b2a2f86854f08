//! World error types.

use std::fmt;
use thiserror::Error;

/// The kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A workflow run.
    Run,
    /// A step within a run.
    Step,
    /// A hook awaiting an external callback.
    Hook,
    /// A named byte stream.
    Stream,
    /// A queue item.
    Item,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Run => write!(f, "run"),
            EntityKind::Step => write!(f, "step"),
            EntityKind::Hook => write!(f, "hook"),
            EntityKind::Stream => write!(f, "stream"),
            EntityKind::Item => write!(f, "item"),
        }
    }
}

/// The taxonomy kind of a [`WorldError`], without its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown run, step, hook or stream.
    NotFound,
    /// Sequence or terminal-state violation.
    Conflict,
    /// Duplicate create.
    AlreadyExists,
    /// Write after close.
    StreamClosed,
    /// A blocking read exceeded its deadline.
    Timeout,
    /// Backend-level failure, eligible for retry.
    Transient,
    /// A value could not be encoded or decoded.
    Codec,
    /// A queue item failed terminally.
    Delivery,
    /// Invalid configuration.
    Configuration,
}

/// Errors returned by every world backend.
///
/// Each variant carries enough context (run, step, hook, stream or item id)
/// to diagnose the failure without exposing backend internals.
///
/// # Non-Exhaustive
///
/// Match with a wildcard arm, or use [`WorldError::kind`]:
///
/// ```
/// use kura_core::{ErrorKind, WorldError};
///
/// fn should_retry(error: &WorldError) -> bool {
///     match error.kind() {
///         ErrorKind::Transient => true,
///         _ => false,
///     }
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum WorldError {
    /// The referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What kind of entity was looked up.
        entity: EntityKind,
        /// Its identifier.
        id: String,
    },

    /// The operation violates sequence ordering or a terminal state.
    #[error("Conflict in run {run_id}: {details}")]
    Conflict {
        /// The run whose history rejected the operation.
        run_id: String,
        /// What was violated.
        details: String,
    },

    /// An entity with this identifier already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// What kind of entity was created.
        entity: EntityKind,
        /// Its identifier.
        id: String,
    },

    /// The stream was closed before this write.
    #[error("Stream closed: {name}")]
    StreamClosed {
        /// The stream name.
        name: String,
    },

    /// A blocking operation exceeded the caller's deadline.
    #[error("Timeout waiting on {entity} {id}")]
    Timeout {
        /// What was being waited on.
        entity: EntityKind,
        /// Its identifier.
        id: String,
    },

    /// A backend I/O failure that may succeed when retried.
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// A value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A queue item exhausted its delivery attempts or was rejected.
    #[error("Delivery of item {item_id} failed after {attempts} attempt(s): {details}")]
    Delivery {
        /// The queue item.
        item_id: String,
        /// How many deliveries were attempted.
        attempts: u32,
        /// The last failure.
        details: String,
    },

    /// The world configuration is invalid.
    #[error("Invalid world configuration: {0}")]
    Configuration(String),
}

impl WorldError {
    pub fn not_found(entity: EntityKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: EntityKind, id: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(run_id: impl fmt::Display, details: impl Into<String>) -> Self {
        Self::Conflict {
            run_id: run_id.to_string(),
            details: details.into(),
        }
    }

    pub fn transient(details: impl fmt::Display) -> Self {
        Self::Transient(details.to_string())
    }

    /// Returns the taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorldError::NotFound { .. } => ErrorKind::NotFound,
            WorldError::Conflict { .. } => ErrorKind::Conflict,
            WorldError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            WorldError::StreamClosed { .. } => ErrorKind::StreamClosed,
            WorldError::Timeout { .. } => ErrorKind::Timeout,
            WorldError::Transient(_) => ErrorKind::Transient,
            WorldError::Codec(_) => ErrorKind::Codec,
            WorldError::Delivery { .. } => ErrorKind::Delivery,
            WorldError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Only transient failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result alias used across the world contract.
pub type Result<T, E = WorldError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorldError::not_found(EntityKind::Run, "wrun_01");
        assert_eq!(error.to_string(), "run not found: wrun_01");

        let error = WorldError::conflict("wrun_01", "step step_1 already completed");
        assert_eq!(
            error.to_string(),
            "Conflict in run wrun_01: step step_1 already completed"
        );

        let error = WorldError::StreamClosed {
            name: "stdout".to_string(),
        };
        assert_eq!(error.to_string(), "Stream closed: stdout");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            WorldError::already_exists(EntityKind::Hook, "hook_1").kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            WorldError::Timeout {
                entity: EntityKind::Stream,
                id: "s1".to_string()
            }
            .kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(WorldError::transient("disk busy").is_retryable());
        assert!(!WorldError::not_found(EntityKind::Step, "step_1").is_retryable());
        assert!(!WorldError::Codec("bad".to_string()).is_retryable());
    }
}
