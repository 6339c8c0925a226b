//! Bounded pool of prepared media handles keyed by source URL.
//!
//! Handles are registered synchronously and prepared in the background by a
//! [`MediaPreparer`]. The cache keeps at most one handle per URL, evicts the
//! least-recently-used entries beyond its capacity, and tracks a single
//! "currently audible" URL so two videos never play sound at once.

mod cache;
mod handle;
mod preparer;
mod stats;

pub use cache::{MediaCacheConfig, MediaHandleCache, DEFAULT_MAX_ENTRIES};
pub use handle::{MediaHandle, ReadyState};
pub use preparer::{MediaMetadata, MediaPreparer, Orientation, PrepareError};
pub use stats::{CacheStats, CacheStatsSnapshot};
