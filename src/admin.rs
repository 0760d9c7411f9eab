use crate::error::{json_error_response, ErrorCode};
use crate::events::Observer;
use crate::manager::InstanceManager;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Version information for the supervisor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted body for relayed notices
const MAX_NOTICE_BODY: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Body of `POST /events`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoticeRequest {
    topic: String,
    instance_id: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Frames a client may send on the event socket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientFrame {
    Ping,
    #[serde(other)]
    Unknown,
}

/// Admin API server: instance control, log access and the event socket
pub struct AdminServer {
    bind_addr: SocketAddr,
    manager: Arc<InstanceManager>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        manager: Arc<InstanceManager>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            manager,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let manager = Arc::clone(&self.manager);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, manager, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    manager: Arc<InstanceManager>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let manager = Arc::clone(&manager);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, manager, token).await }
    });

    // Upgrades are needed for the event socket
    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Look up a query parameter. Values are taken verbatim.
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn check_auth(req: &Request<Incoming>, expected_token: &str, allow_query: bool) -> bool {
    let header_ok = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false);

    // Browsers cannot set headers on a WebSocket handshake
    header_ok || (allow_query && query_param(req.uri().query(), "token") == Some(expected_token))
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let upgrade_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_upgrade && upgrade_websocket
}

async fn handle_admin_request(
    req: Request<Incoming>,
    manager: Arc<InstanceManager>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!(%method, %path, "Admin API request");

    // Health and version need no auth
    let public = method == Method::GET && (path == "/health" || path == "/version");
    let event_socket = method == Method::GET && path == "/events";
    if !public && !check_auth(&req, &auth_token, event_socket) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error_response(ErrorCode::Unauthorized, "unauthorized"));
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let query = query.as_deref();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => response(StatusCode::OK, "ok"),

        (&Method::GET, ["version"]) => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // GET /instances
        (&Method::GET, ["instances"]) => {
            let instances = manager.list();
            let body = serde_json::json!({
                "count": instances.len(),
                "instances": instances,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // GET /instances/{id}
        (&Method::GET, ["instances", id]) => match manager.status(id) {
            Ok(status) => json_response(StatusCode::OK, serde_json::json!(status).to_string()),
            Err(e) => (&e).into(),
        },

        // DELETE /instances/{id}
        (&Method::DELETE, ["instances", id]) => match manager.delete(id).await {
            Ok(()) => json_response(
                StatusCode::OK,
                serde_json::json!({ "instanceId": id, "deleted": true }).to_string(),
            ),
            Err(e) => (&e).into(),
        },

        // POST /instances/{id}/start
        (&Method::POST, ["instances", id, "start"]) => match manager.start(id) {
            Ok(pid) => json_response(
                StatusCode::OK,
                serde_json::json!({ "instanceId": id, "pid": pid }).to_string(),
            ),
            Err(e) => (&e).into(),
        },

        // POST /instances/{id}/stop[?force=true]
        (&Method::POST, ["instances", id, "stop"]) => {
            let force = matches!(query_param(query, "force"), Some("true") | Some("1"));
            match manager.stop(id, force) {
                Ok(()) => json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({ "instanceId": id, "force": force }).to_string(),
                ),
                Err(e) => (&e).into(),
            }
        }

        // POST /instances/{id}/restart
        (&Method::POST, ["instances", id, "restart"]) => match manager.restart(id).await {
            Ok(pid) => json_response(
                StatusCode::OK,
                serde_json::json!({ "instanceId": id, "pid": pid }).to_string(),
            ),
            Err(e) => (&e).into(),
        },

        // GET /instances/{id}/logs[?limit=N]
        (&Method::GET, ["instances", id, "logs"]) => {
            let limit = match query_param(query, "limit").map(str::parse::<usize>) {
                None => Ok(None),
                Some(Ok(limit)) => Ok(Some(limit)),
                Some(Err(_)) => Err(()),
            };
            match limit {
                Err(()) => json_error_response(ErrorCode::BadRequest, "limit must be a non-negative integer"),
                Ok(limit) => match manager.logs(id, limit) {
                    Ok(entries) => json_response(
                        StatusCode::OK,
                        serde_json::json!({ "instanceId": id, "entries": entries }).to_string(),
                    ),
                    Err(e) => (&e).into(),
                },
            }
        }

        // POST /events: relay a collaborator notice
        (&Method::POST, ["events"]) => relay_notice(req, &manager).await,

        // GET /events: event socket
        (&Method::GET, ["events"]) => open_event_socket(req, &manager),

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

async fn relay_notice(req: Request<Incoming>, manager: &InstanceManager) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_NOTICE_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read notice body");
            return json_error_response(ErrorCode::BadRequest, "unreadable or oversized body");
        }
    };

    let notice: NoticeRequest = match serde_json::from_slice(&body) {
        Ok(notice) => notice,
        Err(e) => {
            return json_error_response(ErrorCode::BadRequest, format!("invalid notice: {}", e));
        }
    };
    if notice.topic.trim().is_empty() {
        return json_error_response(ErrorCode::BadRequest, "topic must not be empty");
    }

    manager.relay(&notice.topic, notice.instance_id, notice.payload);
    json_response(StatusCode::ACCEPTED, r#"{"relayed":true}"#)
}

/// Complete the WebSocket handshake and stream bus events to the client
fn open_event_socket(req: Request<Incoming>, manager: &InstanceManager) -> Response<Full<Bytes>> {
    if !is_websocket_upgrade(&req) {
        return json_error_response(ErrorCode::BadRequest, "expected a websocket upgrade");
    }
    let Some(accept_key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        return json_error_response(ErrorCode::BadRequest, "missing Sec-WebSocket-Key");
    };

    // Subscribe now so the snapshot reflects the moment of the handshake
    let observer = manager.subscribe();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                serve_observer(ws, observer).await;
            }
            Err(e) => {
                warn!(error = %e, "Event socket upgrade failed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))
        .expect("valid response builder")
}

async fn serve_observer<S>(ws: WebSocketStream<S>, mut observer: Observer)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let observer_id = observer.id();
    info!(observer = observer_id, "Event socket connected");
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            event = observer.recv() => {
                let Some(event) = event else {
                    debug!(observer = observer_id, "Observer dropped by the bus, closing socket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sink.send(Message::Text(event.to_json().into())).await {
                    debug!(observer = observer_id, error = %e, "Event socket write failed");
                    break;
                }
            }
            message = stream.next() => {
                match message {
                    // Pongs for protocol pings are queued by tungstenite itself
                    Some(Ok(Message::Text(text))) => {
                        let frame = serde_json::from_str::<ClientFrame>(&text).unwrap_or(ClientFrame::Unknown);
                        if let ClientFrame::Ping = frame {
                            if let Err(e) = sink.send(Message::Text(r#"{"type":"pong"}"#.into())).await {
                                debug!(observer = observer_id, error = %e, "Event socket write failed");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(observer = observer_id, error = %e, "Event socket read failed");
                        break;
                    }
                }
            }
        }
    }

    info!(observer = observer_id, "Event socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("limit=5&force=true"), "force"), Some("true"));
        assert_eq!(query_param(Some("limit=5&force=true"), "limit"), Some("5"));
        assert_eq!(query_param(Some("limit=5"), "token"), None);
        assert_eq!(query_param(Some("flag"), "flag"), None);
        assert_eq!(query_param(None, "limit"), None);
    }

    #[test]
    fn test_client_frames() {
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"subscribe","topic":"x"}"#).unwrap(),
            ClientFrame::Unknown
        ));
    }

    #[test]
    fn test_notice_request_defaults() {
        let notice: NoticeRequest = serde_json::from_str(r#"{"topic":"configChanged"}"#).unwrap();
        assert_eq!(notice.topic, "configChanged");
        assert!(notice.instance_id.is_none());
        assert!(notice.payload.is_null());

        let notice: NoticeRequest =
            serde_json::from_str(r#"{"topic":"download","instanceId":"i1","payload":{"pct":3}}"#).unwrap();
        assert_eq!(notice.instance_id.as_deref(), Some("i1"));
        assert_eq!(notice.payload["pct"], 3);
    }
}
