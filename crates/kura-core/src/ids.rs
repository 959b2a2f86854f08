//! Identifier newtypes and the monotonic id generator.

use crate::error::{Result, WorldError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, OnceLock};
use ulid::{Generator, Ulid};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix of generated identifiers of this kind.
            pub const PREFIX: &'static str = $prefix;

            /// Wraps an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generates a fresh, time-ordered identifier.
            pub fn generate() -> Result<Self> {
                Ok(Self(format!("{}_{}", $prefix, next_ulid()?)))
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identity of a workflow run. Generated ids sort by creation time.
    RunId,
    "wrun"
);
define_id!(
    /// Identity of a step within a run.
    StepId,
    "step"
);
define_id!(
    /// Identity of a hook awaiting an external callback.
    HookId,
    "hook"
);
define_id!(
    /// Identity of a queue item, used as the delivery idempotency key.
    ItemId,
    "msg"
);

static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

/// Returns the next ULID from the process-wide monotonic generator.
///
/// Within one millisecond the random component is incremented, so ids are
/// strictly increasing across every caller in the process.
pub fn next_ulid() -> Result<Ulid> {
    let generator = GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    let mut generator = generator
        .lock()
        .map_err(|_| WorldError::transient("id generator lock poisoned"))?;
    generator
        .generate()
        .map_err(|e| WorldError::transient(format!("id generation failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_generated_prefix() {
        let run_id = RunId::generate().unwrap();
        assert!(run_id.as_str().starts_with("wrun_"));
        let hook_id = HookId::generate().unwrap();
        assert!(hook_id.as_str().starts_with("hook_"));
    }

    #[test]
    fn test_generated_ids_are_strictly_increasing() {
        let ids: Vec<RunId> = (0..1000).map(|_| RunId::generate().unwrap()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    let mut local = Vec::new();
                    for _ in 0..250 {
                        local.push(RunId::generate().unwrap());
                    }
                    for pair in local.windows(2) {
                        assert!(pair[0] < pair[1]);
                    }
                    seen.lock().unwrap().extend(local);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 2000);
    }

    #[test]
    fn test_id_conversions() {
        let step: StepId = "step_a".into();
        assert_eq!(step, StepId::new("step_a"));
        assert_eq!(step.to_string(), "step_a");
    }
}
