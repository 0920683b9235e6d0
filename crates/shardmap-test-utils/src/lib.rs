//! Shared test utilities for shardmap integration tests.
//!
//! This crate provides:
//! - [`TestHarness`]: controller, store, source, queue and worker wired together
//! - Scripted mappers ([`MapperScript`]) that count keys and fail on demand
//! - [`TracingStore`]: store wrapper with operation recording and failure injection
//! - [`SimulationHarness`] and [`ChaosStore`]: seeded random fault injection
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use shardmap_test_utils::{assert_job_succeeded, job_config, MapperScript, TestHarness};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     harness.seed("Item", 100);
//!     let script = MapperScript::new();
//!     harness.register("count", script.factory());
//!     let job_id = harness.launch(job_config("Item", "count", 4)).await;
//!     harness.run().await;
//!     assert_job_succeeded(&harness.info(job_id).await);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod simulation;
pub mod storage;

pub use assertions::*;
pub use fixtures::*;
pub use simulation::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("shardmap_core=debug".parse().expect("valid directive"))
                .add_directive("shardmap_mapper=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
