//! Core data models for the ephemeral file drop.
//!
//! Records map to the `file_records` table via `sqlx::FromRow` and serialize
//! as JSON via `serde` for the HTTP layer.

pub mod file_record;
