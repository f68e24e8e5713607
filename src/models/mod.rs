//! Core data models for the versioned file storage service.
//!
//! These entities represent buckets, logical files, immutable version
//! snapshots, cached derivatives, and ephemeral upload sessions. They map
//! cleanly to database tables via `sqlx::FromRow` and serialize naturally
//! as JSON via `serde`.

pub mod bucket;
pub mod derivative;
pub mod file;
pub mod upload_session;
