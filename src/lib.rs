//! Authenticated API backend for prompt-injection classification.
//!
//! The crate covers the auth subsystem end to end: identity storage,
//! Argon2id password hashing, HS256 bearer tokens, a revocable SQLite
//! session registry, and the axum routes that expose them.

pub mod auth;
pub mod config;
pub mod gateway;

pub use config::Config;
