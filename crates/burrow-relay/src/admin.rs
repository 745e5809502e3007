//! Admin and tunnel HTTP surface
//!
//! The same router serves the subscriber admin endpoints and the WebSocket
//! upgrade that devices use to open their tunnel. [`ApiHandler`] mounts it as
//! a route on the relay's mux so it can share a listener with client traffic.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use burrow_router::{Handler, ServeError, WrappedConn};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::auth::{extract_token, Grants};
use crate::models::{ErrorResponse, SubscribersResponse, SuccessResponse};
use crate::session::{upgrade_tunnel, PeerAddr};
use crate::RelayState;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Build the relay's HTTP router
pub fn router(state: Arc<RelayState>) -> Router {
    let api = Router::new()
        .route("/api/subscribers", get(list_subscribers))
        .route(
            "/api/subscribers/{subject}",
            get(get_subscriber).delete(delete_subscriber),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", any(upgrade_tunnel))
        .route("/ws", any(upgrade_tunnel))
        .route("/relay", any(upgrade_tunnel))
        .merge(api)
        .with_state(state)
}

/// Rejects requests without a valid admin token and exposes the caller's
/// grants to handlers as an extension
pub async fn require_auth(
    State(state): State<Arc<RelayState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers(), request.uri()).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("Missing access token")),
        )
    })?;

    let grants = state.authorizer.authorize(&token).await.map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(format!("Invalid or expired token: {}", e))),
        )
    })?;

    if !grants.is_admin() {
        warn!(subject = %grants.sub, "admin API refused for non-admin token");
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("Not authorized for the admin API")),
        ));
    }

    request.extensions_mut().insert(grants);
    Ok(next.run(request).await)
}

async fn list_subscribers(State(state): State<Arc<RelayState>>) -> Json<SubscribersResponse> {
    Json(SubscribersResponse {
        success: true,
        subscribers: state.table.list_subscribers(),
    })
}

async fn get_subscriber(
    State(state): State<Arc<RelayState>>,
    Path(subject): Path<String>,
) -> Result<Json<SubscribersResponse>, ApiError> {
    let status = state.table.subscriber(&subject).ok_or_else(|| not_found(&subject))?;
    Ok(Json(SubscribersResponse {
        success: true,
        subscribers: vec![status],
    }))
}

async fn delete_subscriber(
    State(state): State<Arc<RelayState>>,
    axum::Extension(caller): axum::Extension<Grants>,
    Path(subject): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if !state.table.remove(&subject).await {
        return Err(not_found(&subject));
    }
    info!(subject = %subject, by = %caller.sub, "subscriber disconnected by admin");
    Ok(Json(SuccessResponse { success: true }))
}

fn not_found(subject: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(format!("no subscriber '{}'", subject))),
    )
}

/// Serves the relay router over connections handed to it by the mux
pub struct ApiHandler {
    router: Router,
}

impl ApiHandler {
    pub fn new(state: Arc<RelayState>) -> Self {
        Self {
            router: router(state),
        }
    }
}

#[async_trait]
impl Handler for ApiHandler {
    async fn serve(&self, conn: WrappedConn) -> Result<(), ServeError> {
        let peer = conn.peer_addr().to_string();
        debug!(remote = %peer, "serving relay API connection");

        let router = self.router.clone();
        let service = service_fn(move |mut req: hyper::Request<Incoming>| {
            req.extensions_mut().insert(PeerAddr(peer.clone()));
            router.clone().oneshot(req)
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(conn), service)
            .with_upgrades()
            .await
            .map_err(|e| {
                warn!("relay API connection failed: {}", e);
                ServeError::Other(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Grants, JwtAuthorizer, ADMIN_SUBJECT};
    use crate::subscriber::SubscriberConn;
    use crate::table::ConnectionTable;
    use axum::body::{to_bytes, Body};
    use burrow_mux::TunnelConfig;
    use chrono::Duration;
    use serde_json::Value;
    use tokio::io::sink;

    const SECRET: &[u8] = b"admin_test_secret";

    fn state() -> Arc<RelayState> {
        Arc::new(RelayState {
            table: Arc::new(ConnectionTable::new()),
            authorizer: Arc::new(JwtAuthorizer::new(SECRET)),
            tunnel_config: TunnelConfig::default(),
        })
    }

    fn token() -> String {
        JwtAuthorizer::issue(SECRET, &Grants::new(ADMIN_SUBJECT), Duration::hours(1)).unwrap()
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn add_device(state: &RelayState, sub: &str, remote: &str) -> Arc<SubscriberConn> {
        let grants = Grants::new(sub).with_domains(vec![format!("{}.example.com", sub)]);
        let conn = Arc::new(SubscriberConn::new(remote, grants, sink()));
        state.table.add(conn.clone());
        conn
    }

    #[tokio::test]
    async fn test_requires_token() {
        let app = router(state());
        let response = app.oneshot(request("GET", "/api/subscribers", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(response).await["success"], false);

        let app = router(state());
        let response = app
            .oneshot(request("GET", "/api/subscribers", Some("not-a-jwt")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_and_get_subscribers() {
        let state = state();
        add_device(&state, "alice", "10.0.0.1:4000");
        add_device(&state, "bob", "10.0.0.2:4000");
        let token = token();

        let response = router(state.clone())
            .oneshot(request("GET", "/api/subscribers", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["success"], true);
        let subs = body["subscribers"].as_array().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0]["sub"], "alice");
        assert_eq!(subs[0]["sockets"][0], "10.0.0.1:4000");
        assert_eq!(subs[0]["clients"], 0);

        let response = router(state.clone())
            .oneshot(request("GET", "/api/subscribers/bob", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["subscribers"][0]["sub"], "bob");

        let response = router(state)
            .oneshot(request("GET", "/api/subscribers/carol", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_subscriber_closes_it() {
        let state = state();
        let conn = add_device(&state, "alice", "10.0.0.1:4000");
        let token = token();

        let response = router(state.clone())
            .oneshot(request("DELETE", "/api/subscribers/alice", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["success"], true);
        assert!(conn.is_closed());
        assert!(!state.table.contains("alice.example.com"));

        let response = router(state)
            .oneshot(request("DELETE", "/api/subscribers/alice", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("alice"));
    }

    #[tokio::test]
    async fn test_device_token_cannot_use_admin_api() {
        let state = state();
        let alice = add_device(&state, "alice", "10.0.0.1:4000");
        let mallory = JwtAuthorizer::issue(
            SECRET,
            &Grants::new("mallory").with_domains(vec!["mallory.example.com".to_string()]),
            Duration::hours(1),
        )
        .unwrap();

        let response = router(state.clone())
            .oneshot(request("DELETE", "/api/subscribers/alice", Some(&mallory)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json(response).await["success"], false);
        assert!(!alice.is_closed());
        assert!(state.table.contains("alice.example.com"));

        let response = router(state)
            .oneshot(request("GET", "/api/subscribers", Some(&mallory)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_tunnel_upgrade_checks_token_and_headers() {
        let response = router(state())
            .oneshot(request("GET", "/ws", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router(state())
            .oneshot(request("GET", &format!("/ws?access_token={}", token()), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
