//! Clients that share expensive lookups through a [`SingleFlightCache`](flightcache::SingleFlightCache).
//!
//! - [`UserDirectory`](users::UserDirectory) memoizes user lookups against a users service.
//! - [`DbClient`](db::DbClient) connects to its database lazily, once, and reconnects after a
//!   failed attempt.

pub mod db;
pub mod types;
pub mod users;
