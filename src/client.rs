//! Tunnel client: registers with the relay and serves forwarded requests

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Frame, MessageWriter};
use crate::error::TunnelError;
use crate::executor::LocalExecutor;
use crate::tunnel::{Message, RegisterPayload, RegisteredPayload};

/// A registered connection to the relay
pub struct ClientSession<S> {
    writer: Arc<MessageWriter>,
    stream: SplitStream<WebSocketStream<S>>,
    registered: RegisteredPayload,
    executor: Arc<LocalExecutor>,
    shutdown_grace: Duration,
}

impl ClientSession<MaybeTlsStream<TcpStream>> {
    /// Dial the relay and complete the registration handshake
    pub async fn connect(config: &ClientConfig, executor: LocalExecutor) -> Result<Self> {
        let (ws, _response) = connect_async(config.relay_url.as_str())
            .await
            .with_context(|| format!("Failed to connect to relay at {}", config.relay_url))?;

        Self::handshake(
            ws,
            executor,
            config.registration_timeout,
            config.shutdown_grace,
        )
        .await
    }
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Send `register` and wait for exactly one `registered` reply
    pub async fn handshake(
        ws: WebSocketStream<S>,
        executor: LocalExecutor,
        registration_timeout: Duration,
        shutdown_grace: Duration,
    ) -> Result<Self> {
        let (sink, mut stream) = ws.split();
        let writer = Arc::new(MessageWriter::new(sink));

        writer
            .send(&Message::Register(RegisterPayload::default()))
            .await
            .context("Failed to send registration")?;

        let registered = tokio::time::timeout(registration_timeout, async {
            while let Some(frame) = stream.next().await {
                match Frame::from(frame.context("Connection lost during registration")?) {
                    Frame::Message(Ok(Message::Registered(registered))) => return Ok(registered),
                    Frame::Message(Ok(Message::Error(error))) => {
                        bail!("Registration failed: {}", error.message)
                    }
                    Frame::Message(Ok(other)) => {
                        bail!("Registration failed: unexpected {} message", other.kind())
                    }
                    Frame::Message(Err(e)) => {
                        return Err(anyhow::Error::from(e).context("Registration failed"))
                    }
                    Frame::Close => bail!("Relay closed the connection during registration"),
                    Frame::Skip => {}
                }
            }
            Err::<RegisteredPayload, _>(anyhow!("Relay closed the connection during registration"))
        })
        .await
        .map_err(|_| anyhow!("Registration timed out after {:?}", registration_timeout))??;

        Ok(Self {
            writer,
            stream,
            registered,
            executor: Arc::new(executor),
            shutdown_grace,
        })
    }

    #[must_use]
    pub fn registered(&self) -> &RegisteredPayload {
        &self.registered
    }

    /// Serve forwarded requests until the connection ends or `shutdown` resolves
    ///
    /// Each request runs on its own task. On shutdown the connection is
    /// closed and in-flight requests get the grace period to finish. Losing
    /// the connection or receiving a frame that is not a message envelope is
    /// an error; envelopes of unknown or mismatched type are skipped.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            writer,
            mut stream,
            executor,
            shutdown_grace,
            ..
        } = self;
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Err(anyhow::Error::from(e).context("Connection to relay lost")),
                        None => break Err(anyhow!("Relay closed the connection")),
                    };

                    match Frame::from(frame) {
                        Frame::Message(Ok(Message::Request(request))) => {
                            let writer = writer.clone();
                            let executor = executor.clone();
                            tasks.spawn(async move {
                                let response = executor.execute(request).await;
                                let id = response.id.clone();
                                if let Err(e) = writer.send(&Message::Response(response)).await {
                                    warn!(id = %id, error = %e, "Failed to return response to relay");
                                }
                            });
                        }
                        Frame::Message(Ok(other)) => {
                            debug!(kind = %other.kind(), "Ignoring message from relay");
                        }
                        Frame::Message(Err(e @ TunnelError::Unsupported { .. })) => {
                            warn!(error = %e, "Ignoring message from relay");
                        }
                        Frame::Message(Err(e)) => {
                            break Err(anyhow::Error::from(e).context("Invalid message from relay"));
                        }
                        Frame::Close => break Err(anyhow!("Relay closed the connection")),
                        Frame::Skip => {}
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Request task failed: {}", e);
                    }
                }

                () = &mut shutdown => break Ok(()),
            }
        };

        writer.close().await;

        if outcome.is_ok() && !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for in-flight requests");
            let drained = tokio::time::timeout(shutdown_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(abandoned = tasks.len(), "Grace period elapsed");
            }
        }
        tasks.abort_all();

        outcome
    }
}

pub async fn run_client(config: ClientConfig) -> Result<()> {
    info!("tunl client");
    info!("Local server:  {}", config.local_target);
    info!("Relay server:  {}", config.relay_url);

    let executor = LocalExecutor::new(config.local_target.clone(), config.request_timeout);
    if executor.is_reachable().await {
        info!("Local server is reachable");
    } else {
        warn!("Local server at {} is not reachable yet", executor.target());
    }

    info!("Connecting to relay...");
    let session = ClientSession::connect(&config, executor).await?;

    info!("Tunnel is live!");
    info!("Public URL:  {}", session.registered().url);
    info!("Forwards to: {}", config.local_target);
    info!("Press Ctrl+C to stop the tunnel");

    session
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Tunnel closed. Goodbye!");
    Ok(())
}
