//! Local archive cache for the registry gateway.
//!
//! Provides cache key derivation from request paths, a [`CacheManager`] that
//! owns the on-disk store and classifies keys, an in-flight registry that
//! single-flights concurrent misses, and the background [`Populator`].

pub mod inflight;
pub mod key;
pub mod manager;
pub mod populator;

pub use key::CacheKey;
pub use manager::{CacheManager, CacheState};
pub use populator::{PopulateStart, Populator};
