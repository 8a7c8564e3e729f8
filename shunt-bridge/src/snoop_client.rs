//! Client side of the relay's snoop port
//!
//! Maintains a WebSocket connection to the snoop socket and feeds decoded
//! envelopes into a channel, reconnecting with exponential backoff whenever
//! the relay goes away. The port is read-only, so nothing is ever sent.

use std::time::Duration;

use futures_util::StreamExt;
use shunt_relay::snoop::SnoopMessage;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Start the snoop reader task. The returned receiver yields envelopes until
/// it is dropped, at which point the task winds down.
pub fn spawn(
    url: String,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
) -> mpsc::Receiver<SnoopMessage> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run(url, reconnect_delay, max_reconnect_delay, tx));
    rx
}

async fn run(
    url: String,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    tx: mpsc::Sender<SnoopMessage>,
) {
    let mut delay = reconnect_delay;
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!(%url, "connected to snoop socket");
                delay = reconnect_delay;
                while let Some(message) = ws.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            let envelope: SnoopMessage = match serde_json::from_str(&text) {
                                Ok(envelope) => envelope,
                                Err(err) => {
                                    warn!(%err, "skipping undecodable snoop line");
                                    continue;
                                }
                            };
                            if tx.send(envelope).await.is_err() {
                                debug!("snoop consumer gone, stopping reader");
                                return;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%err, "snoop socket read error");
                            break;
                        }
                    }
                }
                info!(%url, "snoop socket closed");
            }
            Err(err) => {
                warn!(%url, %err, "cannot reach snoop socket");
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_reconnect_delay);
    }
}

#[cfg(test)]
mod tests {
    use futures_util::SinkExt;
    use serde_json::json;
    use shunt_relay::snoop::{Direction, SnoopEvent};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_reads_envelopes_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            let envelope = SnoopMessage::frame(
                Direction::Cp,
                "CP001",
                "ocpp1.6",
                json!([2, "id-1", "Heartbeat", {}]),
            );
            ws.send(Message::Text(serde_json::to_string(&envelope).unwrap()))
                .await
                .unwrap();
        });

        let mut rx = spawn(
            format!("ws://{addr}/"),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event, SnoopEvent::Message);
        assert_eq!(envelope.cp_id, "CP001");
        assert_eq!(envelope.sender, Direction::Cp);
    }
}
