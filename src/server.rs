//! Relay listener and per-tunnel sessions
//!
//! One port serves both public traffic and tunnel clients: a WebSocket
//! upgrade on the tunnel path opens a tunnel, everything else goes to
//! [`crate::ingress`].

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::connection::{Frame, MessageWriter};
use crate::ingress::{self, full_body, text_response, BoxBody};
use crate::registry::{Tunnel, TunnelRegistry};
use crate::tunnel::{Message, RegisteredPayload};

/// State shared by every connection the relay accepts
#[derive(Debug)]
pub struct RelayState {
    pub registry: Arc<TunnelRegistry>,
    pub config: RelayConfig,
}

/// A bound relay, ready to serve
pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen))?;
        let state = Arc::new(RelayState {
            registry: Arc::new(TunnelRegistry::new(config.public_url.clone())),
            config,
        });
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let state = self.state.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { Ok::<_, Infallible>(route(state, req).await) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .with_upgrades()
                                    .await
                                {
                                    debug!("Connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                () = &mut shutdown => {
                    info!("Shutting down relay...");
                    break;
                }
            }
        }

        Ok(())
    }
}

pub async fn run_relay(config: RelayConfig) -> Result<()> {
    let tunnel_path = config.tunnel_path.clone();
    let relay = Relay::bind(config).await?;
    let addr = relay.local_addr()?;

    info!("tunl relay server");
    info!("HTTP server:  http://{}", addr);
    info!("WebSocket:    ws://{}{}", addr, tunnel_path);
    info!("Waiting for tunnel clients to connect...");

    relay
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn route(state: Arc<RelayState>, req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    if req.uri().path() == state.config.tunnel_path && is_websocket_upgrade(&req) {
        accept_tunnel(state, req)
    } else {
        ingress::handle(&state, req).await
    }
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let headers = req.headers();
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    connection_upgrade && upgrade_websocket && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// Answer the WebSocket handshake and run the tunnel session on the upgraded connection
fn accept_tunnel(state: Arc<RelayState>, mut req: Request<hyper::body::Incoming>) -> Response<BoxBody> {
    let accept = match req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| HeaderValue::from_str(&derive_accept_key(key.as_bytes())))
    {
        Some(Ok(accept)) => accept,
        _ => return text_response(StatusCode::BAD_REQUEST, "Invalid WebSocket handshake"),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                run_tunnel_session(ws, state.registry.clone()).await;
            }
            Err(e) => warn!("WebSocket upgrade failed: {}", e),
        }
    });

    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// Drive one tunnel from handshake to teardown
///
/// Registers the tunnel, announces its URL, then routes inbound responses to
/// the pending-request table until the connection ends. Malformed or
/// unexpected messages are logged and skipped.
pub async fn run_tunnel_session<S>(ws: WebSocketStream<S>, registry: Arc<TunnelRegistry>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let tunnel = registry.register(MessageWriter::new(sink)).await;

    let registered = Message::Registered(RegisteredPayload {
        url: tunnel.url().to_string(),
        subdomain: tunnel.subdomain().to_string(),
    });
    if let Err(e) = tunnel.send(&registered).await {
        warn!(subdomain = %tunnel.subdomain(), error = %e, "Failed to send registration");
        teardown(&registry, &tunnel, "registration could not be delivered").await;
        return;
    }
    if !tunnel.activate() {
        teardown(&registry, &tunnel, "closed during registration").await;
        return;
    }

    info!(subdomain = %tunnel.subdomain(), url = %tunnel.url(), "New tunnel");

    let reason = read_loop(&tunnel, &mut stream).await;
    teardown(&registry, &tunnel, &reason).await;
}

async fn read_loop<St>(tunnel: &Tunnel, stream: &mut St) -> String
where
    St: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return format!("read error: {e}"),
        };

        match Frame::from(frame) {
            Frame::Message(Ok(Message::Response(response))) => {
                let id = response.id.clone();
                if !tunnel.pending().fulfill(response) {
                    debug!(subdomain = %tunnel.subdomain(), id = %id, "Dropping response for unknown request");
                }
            }
            Frame::Message(Ok(Message::Register(_))) => {
                debug!(subdomain = %tunnel.subdomain(), "Ignoring register on live tunnel");
            }
            Frame::Message(Ok(other)) => {
                warn!(subdomain = %tunnel.subdomain(), kind = %other.kind(), "Ignoring unexpected message");
            }
            Frame::Message(Err(e)) => {
                warn!(subdomain = %tunnel.subdomain(), error = %e, "Ignoring malformed message");
            }
            Frame::Close => return "client closed connection".to_string(),
            Frame::Skip => {}
        }
    }

    "connection closed".to_string()
}

/// Remove the tunnel, fail its pending requests, close the connection. Runs once per tunnel.
async fn teardown(registry: &TunnelRegistry, tunnel: &Tunnel, reason: &str) {
    if !tunnel.begin_close() {
        return;
    }

    registry.remove(tunnel.subdomain()).await;
    let cancelled = tunnel.pending().cancel_all(reason);
    tunnel.close_connection().await;

    info!(
        subdomain = %tunnel.subdomain(),
        cancelled,
        uptime_secs = tunnel.uptime().as_secs(),
        reason = %reason,
        "Tunnel disconnected"
    );
}
