use crate::config::Listener as ListenerConfig;
use crate::reader::{DirectResponse, FallbackStoreReader, GRAPH_REF_HEADER, ReadError};
use crate::signature::SIGNATURE_HEADER;
use crate::storage::LAST_MODIFIED;
use crate::webhook::{FallbackStoreWriter, WebhookError};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub writer: Arc<FallbackStoreWriter>,
    pub reader: Arc<FallbackStoreReader>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/uplink", post(uplink))
        .route("/supergraph", get(supergraph).post(supergraph))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

pub async fn serve(listener: &ListenerConfig, state: AppState) -> Result<(), ApiError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "fallback store listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
struct Ack {
    ok: bool,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Ack>, WebhookError> {
    state
        .writer
        .handle(header_str(&headers, SIGNATURE_HEADER), &body)
        .await?;
    Ok(Json(Ack { ok: true }))
}

async fn uplink(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    Json(state.reader.uplink(&body).await)
}

async fn supergraph(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<DirectResponse, ReadError> {
    state
        .reader
        .direct(header_str(&headers, GRAPH_REF_HEADER))
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Response {
    let result = match state.writer.ready().await {
        Ok(()) => state.reader.ready().await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "not ready");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

impl IntoResponse for DirectResponse {
    fn into_response(self) -> Response {
        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/graphql")],
            self.sdl,
        )
            .into_response();
        if let Some(last_modified) = self.last_modified
            && let Ok(value) = HeaderValue::from_str(&last_modified)
        {
            response.headers_mut().insert(LAST_MODIFIED, value);
        }
        response
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = if self.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, self.to_string()).into_response()
    }
}

impl IntoResponse for ReadError {
    fn into_response(self) -> Response {
        let status = match &self {
            ReadError::MissingGraphRef | ReadError::GraphRef(_) => StatusCode::BAD_REQUEST,
            err if err.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RouterConfig, UplinkResponse};
    use crate::secrets::{SecretCache, StaticSecretSource};
    use crate::signature::{Algorithm, sign};
    use crate::storage::{CloudStore, ObjectStore};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "webhook-secret";
    const API_KEY: &str = "service:my-graph:key";
    const SDL: &str = "type Query { me: String }";
    const TIMESTAMP: &str = "2024-05-01T12:00:00.000Z";

    fn app() -> Router {
        let store: Arc<dyn ObjectStore> = Arc::new(CloudStore::in_memory());
        let writer = FallbackStoreWriter::new(
            store.clone(),
            Arc::new(SecretCache::new(StaticSecretSource::new(SECRET))),
        );
        let reader = FallbackStoreReader::new(
            store,
            Arc::new(SecretCache::new(StaticSecretSource::new(API_KEY))),
        );
        router(AppState {
            writer: Arc::new(writer),
            reader: Arc::new(reader),
        })
    }

    fn webhook_request(schema_url: &str, signature: Option<String>) -> Request<Body> {
        let body = serde_json::to_vec(&json!({
            "eventType": "BUILD_PUBLISH_EVENT",
            "eventID": "evt-1",
            "supergraphSchemaURL": schema_url,
            "graphID": "my-graph",
            "variantID": "my-graph@current",
            "timestamp": TIMESTAMP,
        }))
        .unwrap();
        let signature =
            signature.unwrap_or_else(|| sign(Algorithm::Sha256, SECRET.as_bytes(), &body));

        Request::post("/webhook")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    fn uplink_request(graph_ref: &str) -> Request<Body> {
        let body = json!({ "variables": { "apiKey": API_KEY, "ref": graph_ref } });
        Request::post("/uplink")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_then_read_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schema.graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SDL))
            .expect(1)
            .mount(&server)
            .await;
        let app = app();

        let response = app
            .clone()
            .oneshot(webhook_request(
                &format!("{}/schema.graphql", server.uri()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, r#"{"ok":true}"#);

        // Direct read
        let response = app
            .clone()
            .oneshot(
                Request::get("/supergraph")
                    .header(GRAPH_REF_HEADER, "my-graph@current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LAST_MODIFIED], TIMESTAMP);
        assert_eq!(body_string(response).await, SDL);

        // Uplink-compatible read
        let response = app
            .oneshot(uplink_request("my-graph@current"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response: UplinkResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            response.data.unwrap().router_config,
            RouterConfig::RouterConfigResult {
                id: TIMESTAMP.into(),
                supergraph_sdl: SDL.into(),
                min_delay_seconds: None,
            }
        );
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_write() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SDL))
            .expect(0)
            .mount(&server)
            .await;
        let app = app();
        let schema_url = format!("{}/schema.graphql", server.uri());

        let response = app
            .clone()
            .oneshot(webhook_request(&schema_url, Some("sha256=00".into())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Invalid signature");

        let request = Request::post("/webhook")
            .body(Body::from(r#"{"eventType":"BUILD_PUBLISH_EVENT"}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Missing signature");

        let request = Request::post("/webhook").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Missing body");

        let response = app
            .oneshot(
                Request::get("/supergraph")
                    .header(GRAPH_REF_HEADER, "my-graph@current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_graph_ref() {
        let app = app();

        let response = app
            .clone()
            .oneshot(uplink_request("unknown-graph@current"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response: UplinkResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(matches!(
            response.data.unwrap().router_config,
            RouterConfig::FetchError { .. }
        ));

        let response = app
            .clone()
            .oneshot(
                Request::post("/supergraph")
                    .header(GRAPH_REF_HEADER, "unknown-graph@current")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/supergraph").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let app = app();

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
