//! Satellite tile acquisition.
//!
//! Tiles are fetched per property coordinate from a [`TileProvider`], stored
//! under a content-addressed path in a [`TileCache`], and recorded in an
//! [`ImageManifest`]. Rate limits and transient failures are retried with
//! bounded backoff; anything still failing is marked missing and the pass
//! continues.

pub mod acquisition;
pub mod cache;
pub mod manifest;
pub mod provider;

pub use acquisition::{acquire_images, fetch_with_retry, RetryPolicy};
pub use cache::{cache_key, TileCache};
pub use manifest::{ImageEntry, ImageManifest, ImageStatus};
pub use provider::{FetchError, MapboxClient, TileProvider, TileRequest, TileSpec};
