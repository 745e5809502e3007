//! Tunnel session acceptance

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use burrow_mux::{Decoder, WsTunnel};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{extract_token, AuthError, Grants};
use crate::models::ErrorResponse;
use crate::subscriber::SubscriberConn;
use crate::table::ConnectionTable;
use crate::RelayState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Not a WebSocket upgrade request")]
    NotWebSocket,

    #[error("HTTP error: {0}")]
    Http(#[from] axum::http::Error),

    #[error("Tunnel failed: {0}")]
    Tunnel(String),
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SessionError::NotWebSocket => StatusCode::BAD_REQUEST,
            SessionError::Http(_) | SessionError::Tunnel(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

/// Remote address of the HTTP connection a request arrived on
#[derive(Debug, Clone)]
pub struct PeerAddr(pub String);

fn websocket_key(req: &Request) -> Result<String, SessionError> {
    let upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|h| h.eq_ignore_ascii_case("websocket"));
    if !upgrade {
        return Err(SessionError::NotWebSocket);
    }

    req.headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .ok_or(SessionError::NotWebSocket)
}

/// Authorize a device and upgrade its request into a tunnel
pub async fn upgrade_tunnel(
    State(state): State<Arc<RelayState>>,
    mut req: Request,
) -> Result<Response, SessionError> {
    let remote = req
        .extensions()
        .get::<PeerAddr>()
        .map(|p| p.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let token = extract_token(req.headers(), req.uri()).ok_or(AuthError::MissingToken)?;
    let grants = match state.authorizer.authorize(&token).await {
        Ok(grants) => grants,
        Err(e) => {
            warn!(remote = %remote, "Tunnel authorization failed: {}", e);
            return Err(e.into());
        }
    };
    let key = websocket_key(&req)?;

    let on_upgrade = hyper::upgrade::on(&mut req);
    let table = state.table.clone();
    let config = state.tunnel_config.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(remote = %remote, "Tunnel upgrade failed: {}", e);
                return;
            }
        };

        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        let tunnel = WsTunnel::new(ws, config);
        if let Err(e) = run_session(tunnel, remote.clone(), grants, table).await {
            debug!(remote = %remote, "Tunnel session ended: {}", e);
        }
    });

    let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(|e| SessionError::Tunnel(e.to_string()))?;
    let response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(Body::empty())?;
    Ok(response)
}

/// Serve a device over an established tunnel until it disconnects.
///
/// The device is registered in `table` for the lifetime of the session and
/// every client stream routed to it is closed when the session ends.
pub async fn run_session<T>(
    tunnel: T,
    remote_addr: String,
    grants: Grants,
    table: Arc<ConnectionTable>,
) -> Result<(), SessionError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = split(tunnel);
    let conn = Arc::new(SubscriberConn::new(remote_addr, grants, writer));
    table.add(conn.clone());

    let mut decoder = Decoder::new(reader);
    let result = tokio::select! {
        r = decoder.decode(conn.as_ref(), conn.cancel_token()) => {
            r.map_err(|e| SessionError::Tunnel(e.to_string()))
        }
        r = conn.run_encoder() => r.map_err(|e| SessionError::Tunnel(e.to_string())),
    };

    table.remove_conn(&conn);
    conn.close().await;
    info!(subject = %conn.subject(), remote = %conn.remote_addr(), "Tunnel closed");
    result
}
