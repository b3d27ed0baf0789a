//! Signaling between two peers over the log.
//!
//! Each direction of a pair has its own key: messages from `a` to `b` are
//! appended to `b + a`, and `a` listens on `a + b`. Appending (rather than
//! relaying) means a peer that subscribes late still replays every offer,
//! answer and candidate addressed to it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use driftline_core::{from_value, to_value, Action, Key, SequenceNumber, SequenceValue};
use driftline_net::{Connection, Subscription};

use crate::error::Result;

/// One ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// A message exchanged during negotiation.
///
/// ```text
/// {"type": "offer", "sdp": "..."}
/// {"type": "answer", "sdp": "..."}
/// {"type": "candidate", "candidate": {...} | null}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: Option<IceCandidate> },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }
}

/// Anything negotiation messages can be sent through.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, message: &SignalingMessage) -> Result<()>;
}

/// The polite side of a pair yields when offers collide.
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Keys used by `local_id` to talk to `remote_id`: `(inbound, outbound)`.
pub fn signaling_keys(local_id: &str, remote_id: &str) -> (Key, Key) {
    (
        Key::new(format!("{local_id}{remote_id}")),
        Key::new(format!("{remote_id}{local_id}")),
    )
}

/// Signaling channel between this client and one remote peer.
pub struct PeerSignalingChannel {
    connection: Connection,
    local_id: String,
    remote_id: String,
    outbound: Key,
    subscription: Mutex<Option<Subscription>>,
}

impl fmt::Debug for PeerSignalingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSignalingChannel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

impl PeerSignalingChannel {
    /// Start listening for messages from `remote_id`.
    ///
    /// Inbound messages, replayed history included, are delivered in log
    /// order on the returned receiver. Each sequence number is delivered
    /// at most once.
    pub fn open(
        connection: &Connection,
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalingMessage>)> {
        let local_id = local_id.into();
        let remote_id = remote_id.into();
        let (inbound, outbound) = signaling_keys(&local_id, &remote_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let last_seq = Mutex::new(SequenceNumber::ZERO);
        let key = inbound.clone();
        let subscription = connection.subscribe(&inbound, move |value: &SequenceValue| {
            {
                let mut last = last_seq.lock();
                if value.seq <= *last {
                    trace!(key = %key, seq = %value.seq, "duplicate signal skipped");
                    return;
                }
                *last = value.seq;
            }
            match from_value::<SignalingMessage>(&value.value) {
                Ok(message) => {
                    let _ = tx.send(message);
                }
                Err(e) => warn!(key = %key, seq = %value.seq, error = %e, "unexpected signal"),
            }
        })?;

        let channel = Arc::new(Self {
            connection: connection.clone(),
            local_id,
            remote_id,
            outbound,
            subscription: Mutex::new(Some(subscription)),
        });
        Ok((channel, rx))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn is_polite(&self) -> bool {
        is_polite(&self.local_id, &self.remote_id)
    }

    /// Append a message for the remote peer.
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        trace!(to = %self.remote_id, kind = message.kind(), "signal");
        let value = to_value(message)?;
        self.connection.push(&self.outbound, value, Action::Append)?;
        Ok(())
    }

    /// Stop listening. Idempotent.
    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            self.connection.unsubscribe(&subscription);
        }
    }
}

impl SignalSink for PeerSignalingChannel {
    fn send_signal(&self, message: &SignalingMessage) -> Result<()> {
        self.send(message)
    }
}

impl Drop for PeerSignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftline_core::{decode_frame, encode_frame, Encoding, MessageFromDb, MessageToDb};
    use driftline_net::memory::{MemoryNetwork, ServerSocket};
    use driftline_net::ConnectionConfig;
    use std::time::Duration;

    async fn connected() -> (Connection, ServerSocket) {
        let network = MemoryNetwork::new();
        let mut accepted = network.listen();
        let conn = Connection::new(Arc::new(network.connector()), ConnectionConfig::default());
        conn.connect("mem://room", Encoding::Json).await.unwrap();
        let server = accepted.recv().await.unwrap();
        (conn, server)
    }

    #[test]
    fn test_wire_shapes() {
        let offer = SignalingMessage::Offer { sdp: "v=0".into() };
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            serde_json::json!({"type": "offer", "sdp": "v=0"})
        );

        let candidate = SignalingMessage::Candidate {
            candidate: Some(IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }),
        };
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            serde_json::json!({
                "type": "candidate",
                "candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}
            })
        );

        let end: SignalingMessage =
            serde_json::from_str(r#"{"type": "candidate", "candidate": null}"#).unwrap();
        assert_eq!(end, SignalingMessage::Candidate { candidate: None });
    }

    #[test]
    fn test_keys_and_politeness() {
        let (inbound, outbound) = signaling_keys("a", "b");
        assert_eq!(inbound.as_str(), "ab");
        assert_eq!(outbound.as_str(), "ba");
        assert!(is_polite("a", "b"));
        assert!(!is_polite("b", "a"));
    }

    #[tokio::test]
    async fn test_send_appends_to_outbound_key() {
        let (conn, mut server) = connected().await;
        let (channel, _rx) = PeerSignalingChannel::open(&conn, "a", "b").unwrap();

        // Replay request for the inbound key comes first.
        let get: MessageToDb = decode_frame(&server.recv().await.unwrap()).unwrap();
        assert_eq!(get, MessageToDb::get("ab"));

        channel
            .send(&SignalingMessage::Answer { sdp: "x".into() })
            .unwrap();
        match decode_frame(&server.recv().await.unwrap()).unwrap() {
            MessageToDb::Push { key, action, value } => {
                assert_eq!(key.as_str(), "ba");
                assert_eq!(action, Action::Append);
                let message: SignalingMessage = from_value(&value).unwrap();
                assert_eq!(message, SignalingMessage::Answer { sdp: "x".into() });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_messages_are_deduplicated() {
        let (conn, server) = connected().await;
        let (_channel, mut rx) = PeerSignalingChannel::open(&conn, "a", "b").unwrap();

        let offer = to_value(&SignalingMessage::Offer { sdp: "o".into() }).unwrap();
        let answer = to_value(&SignalingMessage::Answer { sdp: "r".into() }).unwrap();
        let frames = [
            MessageFromDb::Init {
                key: Key::from("ab"),
                data: Vec::new(),
            },
            MessageFromDb::Push {
                key: Key::from("ab"),
                value: offer.clone(),
                seq: SequenceNumber(1),
            },
            MessageFromDb::Push {
                key: Key::from("ab"),
                value: offer,
                seq: SequenceNumber(1),
            },
            MessageFromDb::Push {
                key: Key::from("ab"),
                value: answer,
                seq: SequenceNumber(2),
            },
        ];
        for frame in frames {
            assert!(server.send(encode_frame(&frame, Encoding::Json).unwrap()));
        }

        assert_eq!(rx.recv().await.unwrap(), SignalingMessage::Offer { sdp: "o".into() });
        assert_eq!(rx.recv().await.unwrap(), SignalingMessage::Answer { sdp: "r".into() });
        let more = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(more.is_err());
    }
}
