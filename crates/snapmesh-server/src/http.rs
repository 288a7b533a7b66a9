//! HTTP surface of a node: `/rpc`, the replication stream endpoints and
//! `/health`.
//!
//! `GET /filesystems/{fs}/{from}/{to}` serves a prelude followed by a send
//! stream; `POST` on the same path receives one. Everything but `/health`
//! requires basic auth with the configured user and API key.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use base64::Engine;
use futures::{StreamExt, TryStreamExt};
use snapmesh_repl::{
    format_progress, restrict_snapshots, ByteCounter, Prelude, ProgressReader, RpcError,
    RpcRequest, RpcResponse,
};
use snapmesh_zfs::{FromSnapshot, SendRange, SendStream};
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::context::NodeContext;
use crate::error::ServerError;
use crate::event::FsmError;
use crate::rpc;

/// Caller identity established by the auth middleware.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub String);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            ServerError::Fsm(e) => {
                let status = match e {
                    FsmError::NoSuchSnapshot { .. } => StatusCode::NOT_FOUND,
                    _ => StatusCode::CONFLICT,
                };
                (status, Json(e)).into_response()
            }
            other => {
                let status = match &other {
                    ServerError::NotFound { .. } => StatusCode::NOT_FOUND,
                    ServerError::AlreadyExists { .. } | ServerError::MasterChanged { .. } => {
                        StatusCode::CONFLICT
                    }
                    ServerError::Invalid { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let body = RpcError {
                    name: other.name().to_string(),
                    message: other.to_string(),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

/// Routes of a node.
pub fn router(ctx: Arc<NodeContext>) -> Router {
    let protected = Router::new()
        .route("/rpc", post(rpc_handler))
        .route(
            "/filesystems/:filesystem_id/:from/:to",
            get(send_handler).post(receive_handler),
        )
        .layer(DefaultBodyLimit::disable())
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth_middleware));

    let public = Router::new().route("/health", get(health_handler));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_handler(State(ctx): State<Arc<NodeContext>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "node_id": ctx.node_id,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// `user:key` from a `Basic` authorization header.
fn basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, key) = decoded.split_once(':')?;
    Some((user.to_string(), key.to_string()))
}

async fn auth_middleware(
    State(ctx): State<Arc<NodeContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(basic_credentials);

    match credentials {
        Some((user, key))
            if constant_time_eq(&user, &ctx.config.user)
                && constant_time_eq(&key, &ctx.config.api_key) =>
        {
            request.extensions_mut().insert(AuthenticatedUser(user));
            next.run(request).await
        }
        _ => {
            debug!(uri = %request.uri(), "rejected unauthenticated request");
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, r#"Basic realm="snapmesh""#)],
                "Unauthorized",
            )
                .into_response()
        }
    }
}

async fn rpc_handler(
    State(ctx): State<Arc<NodeContext>>,
    Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    Json(rpc::handle(&ctx, request, &user).await)
}

/// Serves `filesystem_id` from `from` up to `to`, prelude first.
async fn send_handler(
    State(ctx): State<Arc<NodeContext>>,
    Path((filesystem_id, from, to)): Path<(String, String, String)>,
) -> Result<Response, ServerError> {
    let from = FromSnapshot::parse(&from);
    let fs = ctx.zfs.discover(&filesystem_id).await?;
    if !fs.exists {
        return Err(ServerError::not_found(format!("filesystem {filesystem_id}")));
    }
    let snapshots = restrict_snapshots(&fs.snapshots, &to)
        .ok_or_else(|| ServerError::not_found(format!("snapshot {filesystem_id}@{to}")))?
        .to_vec();
    let prelude = Prelude::new(snapshots).encode()?;

    let range = SendRange::new(filesystem_id.clone(), from, to);
    let SendStream { reader, completion } = ctx.zfs.send(&range).await?;
    info!(filesystem_id, from = %range.from, to = %range.to_snapshot, "serving send stream");

    tokio::spawn(async move {
        if let Err(e) = completion.await {
            warn!(filesystem_id, error = %e, "send stream failed");
        }
    });

    let body = futures::stream::once(async move { Ok::<_, io::Error>(Bytes::from(prelude)) })
        .chain(ReaderStream::new(reader));
    Ok(Body::from_stream(body).into_response())
}

/// Receives a stream into `filesystem_id` and re-applies its metadata.
async fn receive_handler(
    State(ctx): State<Arc<NodeContext>>,
    Path((filesystem_id, from, to)): Path<(String, String, String)>,
    body: Body,
) -> Result<Response, ServerError> {
    if let FromSnapshot::CloneOrigin(origin) = FromSnapshot::parse(&from) {
        let parent = ctx.zfs.discover(&origin.filesystem_id).await?;
        if !parent.has_snapshot(&origin.snapshot_id) {
            warn!(filesystem_id, origin = %origin, "rejecting stream with missing clone origin");
            return Err(FsmError::CloneOriginMissing {
                filesystem_id: origin.filesystem_id,
                snapshot_id: origin.snapshot_id,
            }
            .into());
        }
    }
    let containers = ctx.containers.containers_using(&filesystem_id).await?;
    if !containers.is_empty() {
        return Err(FsmError::CannotReceivePushWhileContainersRunning { containers }.into());
    }

    let counter = ByteCounter::new();
    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let mut reader = BufReader::new(ProgressReader::new(
        StreamReader::new(stream),
        counter.clone(),
    ));
    let prelude = Prelude::read_from(&mut reader).await?;

    let started = Instant::now();
    let receive = ctx.zfs.receive(&filesystem_id, &mut reader);
    tokio::pin!(receive);
    let mut ticker = tokio::time::interval(ctx.config.timing.progress_interval());
    let received = loop {
        tokio::select! {
            result = &mut receive => break result,
            _ = ticker.tick() => {
                debug!(filesystem_id, progress = %format_progress(counter.get(), started.elapsed()), "receiving");
                ctx.notifications.receive_progress.publish(&filesystem_id, counter.get());
            }
        }
    };
    received?;
    ctx.zfs
        .apply_metadata(&filesystem_id, &prelude.snapshot_properties)
        .await?;

    info!(
        filesystem_id,
        to,
        bytes = counter.get(),
        progress = %format_progress(counter.get(), started.elapsed()),
        "stream received"
    );
    ctx.notifications
        .external_snapshots_changed
        .publish(&filesystem_id, ());
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::containers::StaticInventory;
    use snapmesh_store::MemoryStore;
    use snapmesh_zfs::MemoryZfs;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let mut config = NodeConfig::default();
        config.node_id = "node-a".to_string();
        config.user = "admin".to_string();
        config.api_key = "k".to_string();
        router(Arc::new(NodeContext::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryZfs::new()),
            Arc::new(StaticInventory::new()),
        )))
    }

    fn rpc_request(authorization: Option<&str>) -> Request {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::from(r#"{"method":"List"}"#)).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = test_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["node_id"], "node-a");
    }

    #[tokio::test]
    async fn test_rpc_requires_credentials() {
        let response = test_router().oneshot(rpc_request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let authorization = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("admin:k")
        );
        let response = test_router()
            .oneshot(rpc_request(Some(&authorization)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let rpc: RpcResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(rpc.result, Some(serde_json::json!([])));
    }

    #[test]
    fn test_basic_credentials() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("admin:s3cret:x")
        );
        assert_eq!(
            basic_credentials(&header),
            Some(("admin".to_string(), "s3cret:x".to_string()))
        );
        assert_eq!(basic_credentials("Bearer abc"), None);
        assert_eq!(basic_credentials("Basic !!!"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("key", "key"));
        assert!(!constant_time_eq("key", "kez"));
        assert!(!constant_time_eq("key", "keys"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_error_status_codes() {
        let resp = ServerError::not_found("filesystem x").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ServerError::invalid("bad").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = ServerError::from(FsmError::CloneOriginMissing {
            filesystem_id: "fs1".into(),
            snapshot_id: "s1".into(),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
