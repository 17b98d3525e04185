//! Shared handler state, assembled once in `main` and cloned per request.

use crate::{
    clock::Clock,
    services::{
        metadata_store::MetadataStore,
        object_client::ObjectStore,
        reconciler::{Reconciler, ReconcilerConfig},
        registrar::RecordRegistrar,
        upload_service::UploadService,
    },
};
use chrono::TimeDelta;
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadService,
    pub registrar: RecordRegistrar,
    pub objects: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub reconciler: Arc<Reconciler>,
    pub clock: Arc<dyn Clock>,
    /// Advertised in responses as `expires_at = created_at + retention`.
    pub retention: TimeDelta,
}

impl AppState {
    /// Wire the registrar, upload flow and reconciler around the given store
    /// handles. The reconciler's prefix is also the prefix new keys get.
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
        retention: Duration,
        public_base_url: &str,
        reconciler_config: ReconcilerConfig,
    ) -> Self {
        let registrar = RecordRegistrar::new(
            metadata.clone(),
            clock.clone(),
            reconciler_config.store_timeout,
        );
        let uploads = UploadService::new(
            objects.clone(),
            registrar.clone(),
            clock.clone(),
            reconciler_config.prefix.clone(),
            public_base_url,
            reconciler_config.store_timeout,
        );
        let reconciler = Arc::new(Reconciler::new(
            objects.clone(),
            metadata.clone(),
            clock.clone(),
            reconciler_config,
        ));

        Self {
            uploads,
            registrar,
            objects,
            metadata,
            reconciler,
            clock,
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
        }
    }
}
