//! Conformance checks every kura world backend must pass.
//!
//! Checks are plain async functions over a [`WorldFactory`], so they run
//! unmodified against any backend. [`conformance_tests!`] expands all of them
//! into `#[tokio::test]`s:
//!
//! ```rust,ignore
//! struct Memory;
//!
//! #[async_trait::async_trait]
//! impl kura_conformance::WorldFactory for Memory {
//!     // ...
//! }
//!
//! kura_conformance::conformance_tests!(Memory);
//! ```

// Checks assert with expect/unwrap, panics are how they fail
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

pub mod hooks;
pub mod queue;
pub mod storage;
pub mod streams;
mod support;

pub use support::RecordingDelivery;

use async_trait::async_trait;
use kura_core::{Delivery, Queue, RetryPolicy, Storage, Streamer};
use std::sync::Arc;

/// Creates fresh, empty backend instances for each check.
#[async_trait]
pub trait WorldFactory: Send + Sync {
    async fn create_storage(&self) -> Arc<dyn Storage>;

    async fn create_streamer(&self) -> Arc<dyn Streamer>;

    async fn create_queue(&self, delivery: Arc<dyn Delivery>, policy: RetryPolicy)
        -> Arc<dyn Queue>;
}

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kura=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

/// Expands every conformance check into a `#[tokio::test]` against `$factory`.
#[macro_export]
macro_rules! conformance_tests {
    ($factory:expr) => {
        $crate::conformance_tests!(@cases $factory;
            storage::value_round_trip,
            storage::create_and_duplicate_create,
            storage::run_lifecycle,
            storage::step_replay_and_conflict,
            storage::prefix_consistent_reconstruction,
            storage::concurrent_appends_are_contiguous,
            storage::reads_see_consistent_prefix,
            storage::reads_return_independent_copies,
            hooks::hook_resolution_is_idempotent,
            hooks::cleanup_is_idempotent,
            hooks::cleanup_and_resolve_converge,
            hooks::terminal_run_cancels_pending_hooks,
            streams::concrete_scenario,
            streams::order_is_preserved,
            streams::write_then_close_never_drops,
            streams::named_streams_are_isolated,
            streams::stream_owner_is_first_writer,
            streams::write_after_close_fails,
            streams::double_close_is_noop,
            streams::blocked_reader_terminates_on_close,
            streams::read_timeout_releases_subscriber,
            queue::buffered_items_deliver_in_order,
            queue::transient_failures_are_retried,
            queue::failure_is_terminal_after_bound,
            queue::restart_does_not_redeliver,
        );
    };
    (@cases $factory:expr; $($module:ident :: $case:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $case() {
                $crate::init_test_logging();
                let factory = $factory;
                $crate::$module::$case(&factory).await;
            }
        )*
    };
}
