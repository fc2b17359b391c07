//! Reference-counted, asynchronous, cancellable resource cache.
//!
//! The cache maps content-derived [`CacheKey`]s to live [`ResourceLoader`]
//! instances so that overlapping requests for the same bytes are served by a
//! single in-flight load. Loaders advance through the shared state machine in
//! [`state`], settle a single-resolution [`signal::LoadSignal`], and release
//! their child cache references on destroy.
//!
//! A [`cache::ResourceCache`] is session state, not global state: construct
//! one per renderer instance and call [`cache::ResourceCache::maintain`] once
//! per frame on the thread that drives loads.

pub mod cache;
pub mod error;
pub mod fetch;
pub mod frame;
pub mod gpu;
pub mod key;
pub mod loader;
pub mod signal;
pub mod state;

pub mod prelude;

pub use cache::{ResourceCache, ResourceHandle};
pub use error::ResourceError;
pub use fetch::{DataLocation, Fetcher, MemoryFetcher, StandardFetcher};
pub use frame::FrameContext;
pub use key::CacheKey;
pub use loader::{LoaderCore, ResourceLoader};
pub use signal::LoadSignal;
pub use state::ResourceLoaderState;
