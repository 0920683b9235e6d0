//! # shardmap-core
//!
//! Core abstractions shared by the shardmap crates.
//!
//! - **Identifiers**: Strongly-typed IDs for jobs, shards, and mappers
//! - **Keys**: Ordered entity keys, half-open key ranges, opaque cursors
//! - **Configuration**: Environment-variable loaders
//! - **Observability**: Logging initialization and span helpers
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use shardmap_core::prelude::*;
//!
//! let job = JobId::new(1);
//! let shard = ShardId::new(job, 0);
//! let range = KeyRange::new(Some(Key::int("User", 100)), None);
//! assert!(range.contains(&Key::int("User", 150)));
//! # let _ = shard;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod key;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EnvReader;
    pub use crate::error::{Error, Result};
    pub use crate::id::{JobId, MapperId, ShardId};
    pub use crate::key::{Cursor, Key, KeyId, KeyRange};
    pub use crate::observability::{LogFormat, init_logging};
}

pub use config::EnvReader;
pub use error::{Error, Result};
pub use id::{JobId, MapperId, ShardId};
pub use key::{Cursor, Key, KeyId, KeyRange};
pub use observability::{LogFormat, init_logging};
