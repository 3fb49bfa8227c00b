//! Sift Filtering Service
//!
//! Runtime side of the blocker: loads compiled filters from the on-disk
//! cache or compiles them from subscriptions, keeps them current with
//! differential updates, and hands them to the content-blocking engine and
//! the cosmetic injector.
//!
//! ```no_run
//! use sift_service::{FilterConfig, FilterManager};
//!
//! # async fn run() -> Result<(), sift_service::FilterError> {
//! let manager = FilterManager::with_defaults(FilterConfig::default())?;
//! manager.initialize().await;
//! let _updates = manager.start_update_loop();
//! let payload = manager.network_payload().await?;
//! # let _ = payload;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod injector;
pub mod manager;
pub mod overlay;
pub mod status;
pub mod store;
pub mod updater;

pub use config::FilterConfig;
pub use engine::{ContentBlockingEngine, EngineError, FileExportEngine, FILTER_IDENTIFIER};
pub use error::FilterError;
pub use fetch::{FetchError, HttpFetcher, SourceFetcher};
pub use injector::{CosmeticInjector, InjectorStats};
pub use manager::FilterManager;
pub use status::{FilterState, StatusEvent, SubscriptionId};
pub use store::{CacheInfo, CacheMetadata, FileFilterStore, FilterStore, StoreError};
pub use updater::{FilterUpdate, FilterUpdater, UpdateReport};

#[cfg(test)]
pub(crate) mod testing;
