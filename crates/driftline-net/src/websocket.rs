//! WebSocket connector.
//!
//! One writer task drains the outbound channel into the socket sink; one
//! reader task forwards frames from the socket stream until it closes. A
//! failed write is reported as a socket error, so the connection closes and
//! reconnects instead of writing into a dead socket.

use std::fmt::Display;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use driftline_core::Frame;

use crate::error::{NetError, Result};
use crate::transport::{Connector, SocketEvent, SocketHandle};

/// Opens `ws://` sockets with tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SocketHandle> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        let (sink, mut source) = stream.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(sink, out_rx, event_tx.clone()));

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => SocketEvent::Frame(Frame::Text(text)),
                    Ok(Message::Binary(data)) => {
                        SocketEvent::Frame(Frame::Binary(Bytes::from(data)))
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = event_tx.send(SocketEvent::Error(e.to_string()));
                        return;
                    }
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            debug!("websocket stream ended");
            let _ = event_tx.send(SocketEvent::Closed);
        });

        Ok(SocketHandle {
            sender: out_tx,
            events: event_rx,
        })
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<SocketEvent>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };
        if let Err(e) = sink.send(message).await {
            warn!(error = %e, "websocket write failed");
            let _ = events.send(SocketEvent::Error(format!("write failed: {e}")));
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio_tungstenite::tungstenite;

    #[tokio::test]
    async fn test_frames_are_written_in_order() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let written = Arc::clone(&written);
            futures_util::sink::unfold((), move |(), message: Message| {
                let written = Arc::clone(&written);
                async move {
                    written.lock().push(message);
                    Ok::<_, tungstenite::Error>(())
                }
            })
        };
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        out_tx.send(Frame::Text("a".into())).unwrap();
        out_tx.send(Frame::Binary(Bytes::from_static(b"b"))).unwrap();
        drop(out_tx);

        write_loop(Box::pin(sink), out_rx, event_tx).await;

        assert_eq!(
            *written.lock(),
            vec![Message::Text("a".into()), Message::Binary(b"b".to_vec())]
        );
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_write_is_reported_and_stops_writer() {
        let sink = futures_util::sink::unfold(0usize, |written, _message: Message| async move {
            if written == 1 {
                Err(tungstenite::Error::ConnectionClosed)
            } else {
                Ok(written + 1)
            }
        });
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        for text in ["first", "second", "third"] {
            out_tx.send(Frame::Text(text.into())).unwrap();
        }

        write_loop(Box::pin(sink), out_rx, event_tx).await;

        assert!(matches!(event_rx.try_recv(), Ok(SocketEvent::Error(_))));
        assert!(event_rx.try_recv().is_err());
        // the outbound channel is gone, so later sends fail fast
        assert!(out_tx.send(Frame::Text("fourth".into())).is_err());
    }
}
