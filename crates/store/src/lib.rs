//! Redis-backed data layer for a matrimonial profile service.
//!
//! Entities (users, interests, notifications) are flat string hashes under
//! `<entity>:<id>`, enumerated by membership sets and joined through
//! secondary sets and lists. On top of the stores sit the sliding-window
//! rate limiter, one-time codes, and the scheduled premium expiry job.
//!
//! - [`kv`] - the backing-store seam (Redis, or in-memory for tests)
//! - [`encoding`] - string encoding of record fields
//! - [`keys`] - key layout and id normalization
//! - [`stores`] - entity stores and their indexes
//! - [`services`] - workflows over the stores
//! - [`http`] - axum rate limiting middleware

pub mod encoding;
pub mod error;
pub mod http;
pub mod keys;
pub mod kv;
pub mod models;
pub mod services;
pub mod stores;

pub use error::{AppError, Result, StoreError};
pub use kv::{Kv, MemoryKv, RedisKv};
pub use stores::Stores;
