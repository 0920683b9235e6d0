//! Mapper registration.
//!
//! A [`Mapper`] is the user code a job distributes: it is invoked with one
//! page of keys at a time. A [`MapperFactory`] builds a mapper for a given job
//! and shard. Factories are registered by [`MapperId`] in a [`MapperRegistry`]
//! that is built once at process start and handed to the controller.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use shardmap_core::Key;
//! use shardmap_mapper::job::Job;
//! use shardmap_mapper::registry::{MapContext, Mapper, MapperError, MapperRegistry};
//!
//! struct Noop;
//!
//! #[async_trait]
//! impl Mapper for Noop {
//!     async fn map(&self, _ctx: &MapContext<'_>, _keys: &[Key]) -> Result<(), MapperError> {
//!         Ok(())
//!     }
//! }
//!
//! let registry = MapperRegistry::new();
//! registry
//!     .register_factory("noop", |_job: &Job, _shard: u32| -> shardmap_mapper::error::Result<Arc<dyn Mapper>> {
//!         Ok(Arc::new(Noop))
//!     })
//!     .unwrap();
//! assert!(registry.contains(&"noop".into()).unwrap());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use shardmap_core::{JobId, Key, MapperId};

use crate::error::{Error, Result};
use crate::job::Job;

/// Error returned by a mapper for one page.
///
/// The variant decides what happens to the shard: transient errors retry the
/// same page, fatal errors fail the shard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapperError {
    /// Retry-safe failure; the page is retried from the last checkpoint.
    #[error("{message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },
    /// Permanent failure; the shard fails.
    #[error("{message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },
}

impl MapperError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the page may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<Error> for MapperError {
    fn from(error: Error) -> Self {
        if error.is_transient() {
            Self::transient(error.to_string())
        } else {
            Self::fatal(error.to_string())
        }
    }
}

/// Per-invocation context handed to a mapper.
#[derive(Debug, Clone, Copy)]
pub struct MapContext<'a> {
    /// Job being run.
    pub job_id: JobId,
    /// Shard whose page is being mapped.
    pub shard_index: u32,
    /// Parameters from the job config.
    pub params: &'a serde_json::Value,
}

/// User code invoked once per page of keys.
#[async_trait]
pub trait Mapper: Send + Sync {
    /// Processes one page of keys.
    async fn map(&self, ctx: &MapContext<'_>, keys: &[Key]) -> std::result::Result<(), MapperError>;
}

/// Builds a [`Mapper`] for a job's shard.
pub trait MapperFactory: Send + Sync {
    /// Creates the mapper for `shard_index` of `job`.
    ///
    /// # Errors
    ///
    /// A failing factory fails the shard.
    fn create(&self, job: &Job, shard_index: u32) -> Result<Arc<dyn Mapper>>;
}

impl<F> MapperFactory for F
where
    F: Fn(&Job, u32) -> Result<Arc<dyn Mapper>> + Send + Sync,
{
    fn create(&self, job: &Job, shard_index: u32) -> Result<Arc<dyn Mapper>> {
        self(job, shard_index)
    }
}

/// Registry of mapper factories keyed by [`MapperId`].
///
/// Registering the same ID twice is an error; the first registration stays.
#[derive(Default)]
pub struct MapperRegistry {
    factories: RwLock<HashMap<MapperId, Arc<dyn MapperFactory>>>,
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = self.ids().unwrap_or_default();
        f.debug_struct("MapperRegistry").field("ids", &ids).finish()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("mapper registry lock poisoned")
}

impl MapperRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateMapper`] if `id` is already registered.
    pub fn register_factory(
        &self,
        id: impl Into<MapperId>,
        factory: impl MapperFactory + 'static,
    ) -> Result<()> {
        let id = id.into();
        let mut factories = self.factories.write().map_err(poison_err)?;
        if factories.contains_key(&id) {
            drop(factories);
            return Err(Error::DuplicateMapper { mapper_id: id });
        }
        tracing::debug!(mapper_id = %id, "registered mapper factory");
        factories.insert(id, Arc::new(factory));
        drop(factories);
        Ok(())
    }

    /// Looks up the factory registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMapper`] if nothing is registered.
    pub fn get(&self, id: &MapperId) -> Result<Arc<dyn MapperFactory>> {
        let factories = self.factories.read().map_err(poison_err)?;
        factories
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownMapper {
                mapper_id: id.clone(),
            })
    }

    /// Returns true if `id` is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains(&self, id: &MapperId) -> Result<bool> {
        let factories = self.factories.read().map_err(poison_err)?;
        Ok(factories.contains_key(id))
    }

    /// Returns the registered IDs in sorted order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn ids(&self) -> Result<Vec<MapperId>> {
        let factories = self.factories.read().map_err(poison_err)?;
        let mut ids: Vec<MapperId> = factories.keys().cloned().collect();
        drop(factories);
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EntityQuery, JobConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        keys: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Mapper for Counting {
        async fn map(&self, _ctx: &MapContext<'_>, keys: &[Key]) -> std::result::Result<(), MapperError> {
            self.keys.fetch_add(keys.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_factory(keys: Arc<AtomicUsize>) -> impl MapperFactory {
        move |_job: &Job, _shard: u32| -> Result<Arc<dyn Mapper>> {
            Ok(Arc::new(Counting { keys: keys.clone() }))
        }
    }

    #[tokio::test]
    async fn registered_factory_creates_mapper() -> Result<()> {
        let keys = Arc::new(AtomicUsize::new(0));
        let registry = MapperRegistry::new();
        registry.register_factory("count", counting_factory(keys.clone()))?;

        let job = Job::new(JobId::new(1), JobConfig::new(EntityQuery::kind("K"), "count", 1));
        let mapper = registry.get(&"count".into())?.create(&job, 0)?;
        let params = serde_json::Value::Null;
        let ctx = MapContext {
            job_id: job.id,
            shard_index: 0,
            params: &params,
        };
        mapper
            .map(&ctx, &[Key::int("K", 1), Key::int("K", 2)])
            .await
            .expect("mapper succeeds");
        assert_eq!(keys.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = MapperRegistry::new();
        let keys = Arc::new(AtomicUsize::new(0));
        registry
            .register_factory("count", counting_factory(keys.clone()))
            .unwrap();
        let err = registry
            .register_factory("count", counting_factory(keys))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMapper { .. }));
    }

    #[test]
    fn unknown_mapper_lookup_fails() {
        let registry = MapperRegistry::new();
        assert!(matches!(
            registry.get(&"missing".into()),
            Err(Error::UnknownMapper { .. })
        ));
        assert!(!registry.contains(&"missing".into()).unwrap());
    }

    #[test]
    fn mapper_error_display_is_the_message() {
        assert_eq!(MapperError::fatal("boom").to_string(), "boom");
        assert!(MapperError::transient("later").is_transient());
        assert!(!MapperError::fatal("boom").is_transient());
    }

    #[test]
    fn engine_errors_keep_their_class() {
        let transient: MapperError = Error::transient("store busy").into();
        assert!(transient.is_transient());
        let fatal: MapperError = Error::NoSuchJob { job_id: JobId::new(1) }.into();
        assert!(!fatal.is_transient());
    }
}
