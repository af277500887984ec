//! Single-flight caching for async lookups.
//!
//! The [`SingleFlightCache`] coalesces concurrent requests for the same key into one
//! invocation of a caller-supplied loader, keeps successful results around (forever, or
//! for a configured [`retention`](CacheConfig::retention)), and forgets failed attempts so
//! that the next request tries again.
//!
//! ```no_run
//! # async fn example() -> Result<(), std::sync::Arc<std::io::Error>> {
//! use std::sync::Arc;
//! use flightcache::SingleFlightCache;
//!
//! let cache: SingleFlightCache<u32, Arc<String>, Arc<std::io::Error>> = Default::default();
//! let user = cache
//!     .get(1, |id| async move { Ok(Arc::new(format!("user {id}"))) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod cache;
pub mod config;
mod utils;

pub use cache::*;
pub use config::CacheConfig;
pub use utils::CallOnDrop;

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
