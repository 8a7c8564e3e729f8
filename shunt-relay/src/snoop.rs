//! Snoop fan-out
//!
//! Every frame a connection pair forwards is also pushed to the snoop hub,
//! which broadcasts it to all currently connected snoop clients. The snoop
//! port is read-only: anything a client sends is ignored. Clients that
//! cannot keep up are dropped so the relay path never waits on a monitor.
//!
//! Fan-out runs in a single hub task that owns the subscriber set and
//! selects over the frame channel and a control channel, so "broadcast to
//! the current set" is serialized with subscribe/unsubscribe.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Which side of a connection pair produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// The charge point side
    #[serde(rename = "CP")]
    Cp,
    /// The CPMS side
    #[serde(rename = "CPMS")]
    Cpms,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Cp => write!(f, "CP"),
            Direction::Cpms => write!(f, "CPMS"),
        }
    }
}

/// Lifecycle of a snooped event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnoopEvent {
    Connection,
    Disconnection,
    Message,
}

/// In-band envelope delivered to snoop clients, one JSON object per frame.
///
/// `payload` carries the parsed OCPP array for well-formed frames and the
/// raw text as a JSON string for frames the codec could not decode (those
/// are still relayed and still visible to monitors). Binary frames are
/// carried as a base64 JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoopMessage {
    pub event: SnoopEvent,
    pub sender: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub cp_id: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SnoopMessage {
    /// Envelope for a relayed frame.
    pub fn frame(sender: Direction, cp_id: &str, protocol: &str, payload: Value) -> Self {
        Self {
            event: SnoopEvent::Message,
            sender,
            protocol: Some(protocol.to_string()),
            cp_id: cp_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Envelope for a connection pair coming up.
    pub fn connection(cp_id: &str, protocol: &str) -> Self {
        Self {
            event: SnoopEvent::Connection,
            sender: Direction::Cp,
            protocol: Some(protocol.to_string()),
            cp_id: cp_id.to_string(),
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Envelope for a connection pair tearing down.
    pub fn disconnection(cp_id: &str, protocol: &str) -> Self {
        Self {
            event: SnoopEvent::Disconnection,
            sender: Direction::Cp,
            protocol: Some(protocol.to_string()),
            cp_id: cp_id.to_string(),
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }
}

enum HubCommand {
    Subscribe {
        tx: mpsc::Sender<String>,
        ack: oneshot::Sender<()>,
    },
}

/// Handle to the process-wide snoop hub task.
///
/// Cloneable; every connection pair pushes frames through it and the snoop
/// server registers subscribers through it.
#[derive(Clone)]
pub struct SnoopHub {
    frame_tx: mpsc::Sender<SnoopMessage>,
    ctrl_tx: mpsc::Sender<HubCommand>,
}

impl SnoopHub {
    /// Spawn the hub task and return a handle to it.
    pub fn spawn() -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        tokio::spawn(run_hub(frame_rx, ctrl_rx));
        Self { frame_tx, ctrl_tx }
    }

    /// Push one envelope into the fan-out. The hub drains this channel
    /// without ever awaiting a subscriber, so pushes from the relay legs
    /// do not stall behind slow monitors.
    pub async fn publish(&self, msg: SnoopMessage) {
        if self.frame_tx.send(msg).await.is_err() {
            warn!("snoop hub task is gone, dropping envelope");
        }
    }

    /// Register a subscriber queue with the hub. Returns once the hub has
    /// added the queue to its set, so frames published afterwards are
    /// guaranteed to reach it.
    pub async fn subscribe(&self, tx: mpsc::Sender<String>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(HubCommand::Subscribe { tx, ack: ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }
}

async fn run_hub(
    mut frame_rx: mpsc::Receiver<SnoopMessage>,
    mut ctrl_rx: mpsc::Receiver<HubCommand>,
) {
    let mut subscribers: Vec<(u64, mpsc::Sender<String>)> = Vec::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            cmd = ctrl_rx.recv() => match cmd {
                Some(HubCommand::Subscribe { tx, ack }) => {
                    next_id += 1;
                    info!(subscriber = next_id, "snoop subscriber connected");
                    subscribers.push((next_id, tx));
                    let _ = ack.send(());
                }
                None => break,
            },
            msg = frame_rx.recv() => match msg {
                Some(msg) => {
                    let json = match serde_json::to_string(&msg) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("failed to serialize snoop envelope: {}", e);
                            continue;
                        }
                    };

                    subscribers.retain(|(id, tx)| match tx.try_send(json.clone()) {
                        Ok(()) => true,
                        Err(TrySendError::Full(_)) => {
                            warn!(subscriber = id, "snoop subscriber too slow, dropping");
                            false
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(subscriber = id, "snoop subscriber disconnected");
                            false
                        }
                    });
                }
                None => break,
            },
        }
    }

    debug!("snoop hub task exiting");
}

/// WebSocket server for the snoop port.
pub struct SnoopServer {
    hub: SnoopHub,
    queue_depth: usize,
    tls: Option<Arc<tokio_native_tls::TlsAcceptor>>,
}

impl SnoopServer {
    pub fn new(
        hub: SnoopHub,
        queue_depth: usize,
        tls: Option<tokio_native_tls::TlsAcceptor>,
    ) -> Self {
        Self {
            hub,
            queue_depth,
            tls: tls.map(Arc::new),
        }
    }

    /// Bind the snoop port and accept clients until the listener fails.
    pub async fn run(self, host: &str, port: u16) -> Result<(), RelayError> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("Snoop server listening on {}:{}", host, port);
        self.serve_with(listener).await
    }

    /// Accept snoop clients on an already-bound listener.
    pub async fn serve_with(self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept snoop connection: {}", e);
                    continue;
                }
            };
            debug!(peer = %peer, "new snoop connection");

            let hub = self.hub.clone();
            let queue_depth = self.queue_depth;
            let tls = self.tls.clone();

            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_subscriber(tls_stream, hub, queue_depth).await,
                        Err(e) => {
                            warn!(peer = %peer, "snoop TLS handshake failed: {}", e);
                            return;
                        }
                    },
                    None => serve_subscriber(stream, hub, queue_depth).await,
                };

                if let Err(e) = result {
                    debug!(peer = %peer, "snoop connection ended: {}", e);
                }
            });
        }
    }
}

async fn serve_subscriber<S>(stream: S, hub: SnoopHub, queue_depth: usize) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = accept_async(stream).await?;
    let (queue_tx, queue_rx) = mpsc::channel(queue_depth);
    hub.subscribe(queue_tx).await;
    pump_subscriber(ws, queue_rx).await;
    Ok(())
}

/// Drain the subscriber queue onto the socket and swallow everything the
/// client sends. A `None` from the queue means the hub dropped us for
/// falling behind, which closes the connection with a policy close code.
async fn pump_subscriber<S>(ws: WebSocketStream<S>, mut queue_rx: mpsc::Receiver<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            queued = queue_rx.recv() => match queued {
                Some(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Policy,
                            reason: "subscriber queue overrun".into(),
                        })))
                        .await;
                    break;
                }
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(msg)) => {
                    // Read-only port
                    debug!("ignoring inbound snoop payload: {:?}", msg);
                }
                Some(Err(_)) | None => break,
            },
        }
    }

    info!("Snoop connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope(i: usize) -> SnoopMessage {
        SnoopMessage::frame(
            Direction::Cp,
            "CP001",
            "ocpp1.6",
            serde_json::json!([2, format!("m{}", i), "Heartbeat", {}]),
        )
    }

    #[test]
    fn test_envelope_wire_shape() {
        let msg = sample_envelope(1);
        let json: Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();

        assert_eq!(json["event"], "Message");
        assert_eq!(json["sender"], "CP");
        assert_eq!(json["protocol"], "ocpp1.6");
        assert_eq!(json["cp_id"], "CP001");
        assert_eq!(json["payload"][2], "Heartbeat");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = SnoopMessage::connection("CP007", "ocpp2.0.1");
        let back: SnoopMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(back.event, SnoopEvent::Connection);
        assert_eq!(back.cp_id, "CP007");
        assert_eq!(back.sender, Direction::Cp);
    }

    #[tokio::test]
    async fn test_hub_broadcasts_in_order() {
        let hub = SnoopHub::spawn();

        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        hub.subscribe(tx_a).await;
        hub.subscribe(tx_b).await;

        for i in 0..5 {
            hub.publish(sample_envelope(i)).await;
        }

        for i in 0..5 {
            let a = rx_a.recv().await.unwrap();
            let b = rx_b.recv().await.unwrap();
            assert_eq!(a, b);
            let parsed: SnoopMessage = serde_json::from_str(&a).unwrap();
            assert_eq!(parsed.payload[1], format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_without_affecting_others() {
        let hub = SnoopHub::spawn();

        // The slow subscriber has room for two envelopes and never reads.
        let (tx_slow, rx_slow) = mpsc::channel(2);
        let (tx_ok, mut rx_ok) = mpsc::channel(64);
        hub.subscribe(tx_slow).await;
        hub.subscribe(tx_ok).await;

        for i in 0..10 {
            hub.publish(sample_envelope(i)).await;
        }

        // The healthy subscriber sees the full stream.
        for i in 0..10 {
            let json = rx_ok.recv().await.unwrap();
            let parsed: SnoopMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.payload[1], format!("m{}", i));
        }

        // The slow one was dropped once its queue filled: sender gone.
        drop(rx_slow);
        hub.publish(sample_envelope(10)).await;
        let json = rx_ok.recv().await.unwrap();
        let parsed: SnoopMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.payload[1], "m10");
    }

    #[tokio::test]
    async fn test_mid_stream_subscriber_sees_only_later_frames() {
        let hub = SnoopHub::spawn();

        let (tx_a, mut rx_a) = mpsc::channel(16);
        hub.subscribe(tx_a).await;
        hub.publish(sample_envelope(0)).await;

        // Drain so we know the hub processed the first frame before the
        // second subscriber registers.
        let first = rx_a.recv().await.unwrap();
        let parsed: SnoopMessage = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed.payload[1], "m0");

        let (tx_b, mut rx_b) = mpsc::channel(16);
        hub.subscribe(tx_b).await;
        hub.publish(sample_envelope(1)).await;

        let late = rx_b.recv().await.unwrap();
        let parsed: SnoopMessage = serde_json::from_str(&late).unwrap();
        assert_eq!(parsed.payload[1], "m1");
    }
}
