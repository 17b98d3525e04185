//! Defines the HTTP surface of the file drop.
//!
//! ## Structure
//! - **Files**
//!   - `POST /api/files/upload`: multipart upload, field `file`
//!   - `GET  /api/files/{id}`: record lookup, 404 once expired
//!
//! - **Public links**
//!   - `GET  /objects/{*key}`: object bytes while the record is live
//!
//! - **Operations**
//!   - `POST /admin/sweep`: run one reconciliation cycle now
//!   - `GET  /healthz`, `GET /readyz`
//!
//! The wildcard `*key` allows nested keys like `uploads/1700000000000-ab12.png`.

use crate::{
    handlers::{
        admin_handlers::trigger_sweep,
        file_handlers::{download_object, get_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. Uploads larger than `max_upload_bytes` are rejected
/// with 413 before any store is touched.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/files/upload",
            post(upload_file).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/api/files/{id}", get(get_file))
        .route("/objects/{*key}", get(download_object))
        .route("/admin/sweep", post(trigger_sweep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        services::{
            metadata_store::{MetadataStore, SqliteMetadataStore, memory_pool},
            object_client::ObjectStore,
            reconciler::ReconcilerConfig,
            remote_store::RemoteObjectStore,
            testing::{FlakyMetadataStore, FlakyObjectStore},
        },
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
        response::Response,
    };
    use bytes::Bytes;
    use chrono::{TimeDelta, Utc};
    use serde_json::Value;
    use std::{sync::Arc, time::Duration};
    use tower::ServiceExt;

    const BOUNDARY: &str = "ephemeral-test-boundary";

    struct TestApp {
        clock: Arc<ManualClock>,
        objects: Arc<dyn ObjectStore>,
        router: Router,
    }

    impl TestApp {
        async fn new() -> Self {
            Self::with_stores(|objects| objects, |metadata| metadata, ReconcilerConfig::default())
                .await
        }

        /// Serve through wrapped stores; `objects` stays the unwrapped one.
        async fn with_stores(
            wrap_objects: impl FnOnce(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore>,
            wrap_metadata: impl FnOnce(Arc<dyn MetadataStore>) -> Arc<dyn MetadataStore>,
            config: ReconcilerConfig,
        ) -> Self {
            let clock = Arc::new(ManualClock::at(Utc::now()));
            let objects: Arc<dyn ObjectStore> = Arc::new(RemoteObjectStore::new(
                Arc::new(object_store::memory::InMemory::new()),
                "memory://bucket",
            ));
            let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(
                memory_pool().await,
                Duration::from_secs(600),
                clock.clone(),
            ));
            let state = AppState::new(
                wrap_objects(objects.clone()),
                wrap_metadata(metadata),
                clock.clone(),
                Duration::from_secs(600),
                "http://localhost:5001/objects",
                config,
            );
            Self {
                clock,
                objects,
                router: routes(1024 * 1024).with_state(state),
            }
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }

        async fn upload(&self, field: &str, filename: &str, content: &[u8]) -> Response {
            let mut body = Vec::new();
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\n\
                     Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
                     Content-Type: text/plain\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

            let request = Request::post("/api/files/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(body))
                .unwrap();
            self.send(request).await
        }

        async fn get(&self, uri: &str) -> Response {
            self.send(Request::get(uri).body(Body::empty()).unwrap())
                .await
        }
    }

    async fn json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_then_lookup_then_download() {
        let app = TestApp::new().await;

        let response = app.upload("file", "notes.txt", b"hello drop").await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json(response).await;
        assert_eq!(body["message"], "File uploaded successfully");

        let file = &body["file"];
        let id = file["id"].as_str().unwrap().to_string();
        let key = file["store_key"].as_str().unwrap().to_string();
        assert!(key.starts_with("uploads/"));
        assert!(key.ends_with(".txt"));
        assert_eq!(file["original_name"], "notes.txt");
        assert_eq!(file["size_bytes"], 10);
        assert_eq!(
            file["public_url"],
            format!("http://localhost:5001/objects/{key}")
        );
        assert!(file["expires_at"].is_string());

        let response = app.get(&format!("/api/files/{id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["store_key"], key.as_str());

        let response = app.get(&format!("/objects/{key}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello drop"));
    }

    #[tokio::test]
    async fn upload_without_file_field_is_rejected() {
        let app = TestApp::new().await;
        let response = app.upload("attachment", "notes.txt", b"hello").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "No file uploaded");
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() {
        let app = TestApp::new().await;

        let response = app
            .get("/api/files/5b0f7a51-2a5f-4c43-9a0c-7d3c1c0f3e55")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "File not found or expired");

        let response = app.get("/api/files/not-a-uuid").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expired_upload_disappears_and_is_swept() {
        let app = TestApp::new().await;
        let body = json(app.upload("file", "a.txt", b"bye").await).await;
        let id = body["file"]["id"].as_str().unwrap().to_string();
        let key = body["file"]["store_key"].as_str().unwrap().to_string();

        app.clock.advance(TimeDelta::seconds(601));

        let response = app.get(&format!("/api/files/{id}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app.get(&format!("/objects/{key}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // The object outlives its record until a sweep removes it.
        assert!(app.objects.get(&key).await.is_ok());

        let response = app
            .send(Request::post("/admin/sweep").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let report = json(response).await;
        assert_eq!(report["orphans"], 1);
        assert_eq!(report["deleted"], 1);

        assert!(app.objects.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn probes_report_ok() {
        let app = TestApp::new().await;

        let response = app.get("/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");

        let response = app.get("/readyz").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["checks"]["metadata"]["ok"], true);
        assert_eq!(body["checks"]["object_store"]["ok"], true);
    }

    fn short_timeout() -> ReconcilerConfig {
        ReconcilerConfig {
            store_timeout: Duration::from_millis(50),
            ..ReconcilerConfig::default()
        }
    }

    #[tokio::test]
    async fn readiness_fails_when_metadata_ping_hangs() {
        let app = TestApp::with_stores(
            |objects| objects,
            |metadata| {
                let flaky = FlakyMetadataStore::new(metadata).stall_ping();
                Arc::new(flaky) as Arc<dyn MetadataStore>
            },
            short_timeout(),
        )
        .await;

        let response = app.get("/readyz").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json(response).await;
        assert_eq!(body["checks"]["metadata"]["ok"], false);
        assert_eq!(body["checks"]["object_store"]["ok"], true);
    }

    #[tokio::test]
    async fn download_that_hangs_is_unavailable() {
        let app = TestApp::with_stores(
            |objects| {
                let flaky = FlakyObjectStore::new(objects).stall_gets();
                Arc::new(flaky) as Arc<dyn ObjectStore>
            },
            |metadata| metadata,
            short_timeout(),
        )
        .await;
        let body = json(app.upload("file", "a.txt", b"slow").await).await;
        let key = body["file"]["store_key"].as_str().unwrap().to_string();

        let response = app.get(&format!("/objects/{key}")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
