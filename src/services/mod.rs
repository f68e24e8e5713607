//! Core service layer.
//!
//! Each service owns one concern and holds an injected handle to the shared
//! SQLite pool (and, where bytes are involved, the content store). Nothing
//! here touches HTTP.

pub mod content_store;
pub mod signed_url;
pub mod sweeper;
pub mod transform_service;
pub mod trash_service;
pub mod upload_service;
pub mod version_service;
