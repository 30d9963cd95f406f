//! WebSocket transport adapter shared by relay and client
//!
//! Reads happen on one dedicated loop per connection, but many tasks write
//! concurrently (public requests on the relay, executors on the client).
//! [`MessageWriter`] serializes those writes so frames never interleave.

use std::pin::Pin;

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use crate::error::{Result, TunnelError};
use crate::tunnel::Message;

type BoxSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

/// Write half of a tunnel connection, safe to share between tasks
pub struct MessageWriter {
    sink: Mutex<BoxSink>,
}

impl MessageWriter {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<WsMessage, Error = WsError> + Send + 'static,
    {
        Self {
            sink: Mutex::new(Box::pin(sink)),
        }
    }

    /// Encode and write one message as a text frame
    ///
    /// # Errors
    ///
    /// Returns a send error if the connection is closed or the write fails.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let text = message.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::text(text))
            .await
            .map_err(TunnelError::send)
    }

    /// Send a close frame; errors mean the connection is already gone
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "Close on finished connection");
        }
    }
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter").finish_non_exhaustive()
    }
}

/// What a read loop should do with one inbound frame
#[derive(Debug)]
pub enum Frame {
    /// A data frame, decoded (or not) into a protocol message
    Message(Result<Message>),
    /// The peer closed the connection
    Close,
    /// Ping/pong and raw frames, handled by the transport
    Skip,
}

impl From<WsMessage> for Frame {
    fn from(frame: WsMessage) -> Self {
        match frame {
            WsMessage::Text(text) => Self::Message(Message::decode(text.as_bytes())),
            WsMessage::Binary(data) => Self::Message(Message::decode(&data)),
            WsMessage::Close(_) => Self::Close,
            _ => Self::Skip,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    /// Two ends of an in-memory WebSocket connection: (server, client)
    pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use bytes::Bytes;
    use futures_util::StreamExt;

    use super::test_util::ws_pair;
    use super::*;
    use crate::tunnel::{Headers, RequestPayload};

    fn request(id: usize) -> Message {
        Message::Request(RequestPayload {
            id: format!("req-{id}"),
            method: "POST".to_string(),
            path: format!("/items/{id}"),
            headers: Headers::new(),
            body: Bytes::from(vec![b'x'; 4096]),
        })
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let (server, mut client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = Arc::new(MessageWriter::new(sink));

        let mut handles = Vec::new();
        for id in 0..32 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move { writer.send(&request(id)).await }));
        }

        let mut seen = HashSet::new();
        for _ in 0..32 {
            let frame = client.next().await.unwrap().unwrap();
            let Frame::Message(Ok(Message::Request(req))) = Frame::from(frame) else {
                panic!("expected a request frame");
            };
            assert_eq!(req.body.len(), 4096);
            seen.insert(req.id);
        }
        assert_eq!(seen.len(), 32);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (server, _client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = MessageWriter::new(sink);

        writer.close().await;
        let err = writer.send(&request(1)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Send { .. }));
    }

    #[test]
    fn test_frame_classification() {
        assert!(matches!(
            Frame::from(WsMessage::text(r#"{"type":"register","payload":null}"#)),
            Frame::Message(Ok(Message::Register(_)))
        ));
        assert!(matches!(
            Frame::from(WsMessage::text("not json")),
            Frame::Message(Err(_))
        ));
        assert!(matches!(Frame::from(WsMessage::Close(None)), Frame::Close));
        assert!(matches!(
            Frame::from(WsMessage::Ping(Vec::new().into())),
            Frame::Skip
        ));
    }
}
