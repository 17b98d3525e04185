//! Core services: store adapters, the record registrar, the upload flow and
//! the orphan reconciler.

pub mod local_store;
pub mod metadata_store;
pub mod object_client;
pub mod reconciler;
pub mod registrar;
pub mod remote_store;
pub mod upload_service;

#[cfg(test)]
pub mod testing;
