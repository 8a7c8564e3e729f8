//! OCPP relay server and connection pairs
//!
//! The relay presents itself to chargers as the CPMS and to the CPMS as the
//! charger. It "implements" OCPP by blindly forwarding frames between the
//! two legs: no validation, no transaction state, no charger registry. Every
//! forwarded frame is also pushed to the snoop hub tagged with direction and
//! charge point id.
//!
//! Lifecycle per charger connection:
//! - accept, read the URL path (charge point id) and requested subprotocol
//! - dial the CPMS with the same path suffix and subprotocol, retrying with
//!   exponential backoff while the charger leg stays open
//! - run the forwarding loop until either leg closes or errors; a dropped
//!   CPMS leg is redialed with the same backoff while the charger leg is
//!   held open, a dropped charger leg tears the CPMS leg down immediately

use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async, connect_async_tls_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{self, header, HeaderValue, Uri},
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::snoop::{Direction, SnoopHub, SnoopMessage};
use crate::tls;

/// Charger-facing WebSocket server that spawns one connection pair per
/// accepted charger.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    hub: SnoopHub,
    tls: Option<Arc<tokio_native_tls::TlsAcceptor>>,
    cpms_tls: Option<native_tls::TlsConnector>,
}

impl RelayServer {
    /// Build the server from a resolved configuration. TLS material is
    /// loaded eagerly so bad paths fail at startup, not at first accept.
    pub fn new(config: RelayConfig, hub: SnoopHub) -> Result<Self, RelayError> {
        config.validate()?;

        let tls = match (&config.ssl_cert, &config.ssl_key) {
            (Some(cert), Some(key)) => Some(Arc::new(tls::acceptor(cert, key)?)),
            _ => None,
        };
        let cpms_tls = tls::cpms_connector(config.cpms_ca.as_deref())?;

        Ok(Self {
            config: Arc::new(config),
            hub,
            tls,
            cpms_tls,
        })
    }

    /// Bind the relay port and accept charger connections until the
    /// listener fails.
    pub async fn run(self) -> Result<(), RelayError> {
        let listener =
            TcpListener::bind((self.config.ocpp_host.as_str(), self.config.ocpp_port)).await?;
        info!(
            "Relay server listening on {}:{}",
            self.config.ocpp_host, self.config.ocpp_port
        );
        self.serve_with(listener).await
    }

    /// Accept charger connections on an already-bound listener.
    pub async fn serve_with(self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept charger connection: {}", e);
                    continue;
                }
            };
            info!(peer = %peer, "new charger connection");

            let config = self.config.clone();
            let hub = self.hub.clone();
            let tls = self.tls.clone();
            let cpms_tls = self.cpms_tls.clone();

            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            ConnectionPair::serve(tls_stream, config, hub, cpms_tls).await
                        }
                        Err(e) => {
                            warn!(peer = %peer, "charger TLS handshake failed: {}", e);
                            return;
                        }
                    },
                    None => ConnectionPair::serve(stream, config, hub, cpms_tls).await,
                };

                match result {
                    Ok(()) => info!(peer = %peer, "connection pair closed"),
                    Err(e) => warn!(peer = %peer, "connection pair ended: {}", e),
                }
            });
        }
    }
}

/// Which leg of a pair ended a forwarding session.
enum LegClosed {
    Charger,
    Cpms,
}

/// One charger-facing connection bound to one CPMS-facing connection.
pub(crate) struct ConnectionPair;

impl ConnectionPair {
    /// Run a full pair lifecycle on an accepted charger stream.
    async fn serve<S>(
        stream: S,
        config: Arc<RelayConfig>,
        hub: SnoopHub,
        cpms_tls: Option<native_tls::TlsConnector>,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut path = String::new();
        let mut requested_protocol = None;

        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            if let Some(proto) = req.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
                // Mirror whatever the charger asked for; the relay does not
                // care which OCPP version is spoken.
                requested_protocol = proto.to_str().ok().map(str::to_string);
                resp.headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, proto.clone());
            }
            Ok(resp)
        };

        let mut charger_ws = accept_hdr_async(stream, callback).await?;

        let cp_id = path.trim_matches('/').to_string();
        let protocol = match requested_protocol {
            Some(p) => p,
            None => {
                error!(
                    cp_id = %cp_id,
                    "charger did not request a subprotocol; one is required for OCPP, closing"
                );
                let _ = charger_ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Protocol,
                        reason: "OCPP requires a WebSocket subprotocol".into(),
                    }))
                    .await;
                return Err(RelayError::MissingSubprotocol);
            }
        };

        info!(cp_id = %cp_id, protocol = %protocol, "charge point connected");

        let mut cpms_ws = match dial_with_backoff(&config, &cpms_tls, &cp_id, &protocol).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = charger_ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Again,
                        reason: "CPMS unreachable".into(),
                    }))
                    .await;
                return Err(e);
            }
        };

        hub.publish(SnoopMessage::connection(&cp_id, &protocol)).await;

        // A CPMS leg that drops mid-session is redialed while the charger
        // leg is held open; only the charger leg ending finishes the pair.
        let result = loop {
            match relay_session(&mut charger_ws, &mut cpms_ws, &cp_id, &protocol, &hub).await {
                (LegClosed::Charger, session) => {
                    info!(cp_id = %cp_id, "charger leg closed");
                    let _ = cpms_ws.close(None).await;
                    break session;
                }
                (LegClosed::Cpms, session) => {
                    if let Err(e) = session {
                        warn!(cp_id = %cp_id, "CPMS leg dropped ({}), redialing", e);
                    } else {
                        warn!(cp_id = %cp_id, "CPMS leg closed, redialing");
                    }
                    match dial_with_backoff(&config, &cpms_tls, &cp_id, &protocol).await {
                        Ok(ws) => cpms_ws = ws,
                        Err(e) => {
                            let _ = charger_ws
                                .close(Some(CloseFrame {
                                    code: CloseCode::Again,
                                    reason: "CPMS unreachable".into(),
                                }))
                                .await;
                            break Err(e);
                        }
                    }
                }
            }
        };

        hub.publish(SnoopMessage::disconnection(&cp_id, &protocol)).await;
        result
    }
}

/// Forward frames in both directions until one leg closes or errors.
/// Returns which leg ended the session so the caller can decide between
/// teardown and redial.
async fn relay_session<S>(
    charger_ws: &mut WebSocketStream<S>,
    cpms_ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    cp_id: &str,
    protocol: &str,
    hub: &SnoopHub,
) -> (LegClosed, Result<(), RelayError>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            from_charger = charger_ws.next() => match from_charger {
                Some(Ok(Message::Close(frame))) => {
                    let _ = cpms_ws.send(Message::Close(frame)).await;
                    return (LegClosed::Charger, Ok(()));
                }
                Some(Ok(msg)) => {
                    if let Err(e) =
                        relay_frame(msg, cpms_ws, Direction::Cp, cp_id, protocol, hub).await
                    {
                        return (LegClosed::Cpms, Err(e));
                    }
                }
                Some(Err(e)) => return (LegClosed::Charger, Err(e.into())),
                None => return (LegClosed::Charger, Ok(())),
            },
            from_cpms = cpms_ws.next() => match from_cpms {
                Some(Ok(Message::Close(_))) => return (LegClosed::Cpms, Ok(())),
                Some(Ok(msg)) => {
                    if let Err(e) =
                        relay_frame(msg, charger_ws, Direction::Cpms, cp_id, protocol, hub).await
                    {
                        return (LegClosed::Charger, Err(e));
                    }
                }
                Some(Err(e)) => return (LegClosed::Cpms, Err(e.into())),
                None => return (LegClosed::Cpms, Ok(())),
            },
        }
    }
}

/// Push the tagged snoop copy of one frame, then send it unmodified on the
/// opposite leg. Text that fails to parse as JSON is still forwarded
/// byte-for-byte; its snoop envelope carries the raw string. Binary frames
/// (not part of OCPP-J, but relayed regardless) are tagged with a base64
/// string payload.
async fn relay_frame<K>(
    msg: Message,
    sink: &mut K,
    direction: Direction,
    cp_id: &str,
    protocol: &str,
    hub: &SnoopHub,
) -> Result<(), RelayError>
where
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match msg {
        Message::Text(text) => {
            let payload = match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(e) => {
                    debug!(cp_id = %cp_id, "forwarding undecodable frame: {}", e);
                    Value::String(text.clone())
                }
            };
            hub.publish(SnoopMessage::frame(direction, cp_id, protocol, payload))
                .await;
            debug!(cp_id = %cp_id, "relayed frame from {}", direction);
            sink.send(Message::Text(text)).await?;
        }
        Message::Binary(bin) => {
            hub.publish(SnoopMessage::frame(
                direction,
                cp_id,
                protocol,
                binary_payload(&bin),
            ))
            .await;
            sink.send(Message::Binary(bin)).await?;
        }
        // Pings and pongs are answered per-socket by tungstenite and are
        // not relayed across legs; Close is handled by the session loop.
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => {}
    }
    Ok(())
}

/// Dial the CPMS with bounded exponential backoff up to the configured
/// attempt ceiling.
async fn dial_with_backoff(
    config: &RelayConfig,
    cpms_tls: &Option<native_tls::TlsConnector>,
    cp_id: &str,
    protocol: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, RelayError> {
    let mut delay = config.reconnect_delay();
    let mut attempts: u32 = 0;
    loop {
        match dial_cpms(config, cpms_tls, cp_id, protocol).await {
            Ok(ws) => return Ok(ws),
            Err(e) => {
                attempts += 1;
                if attempts >= config.max_reconnect_attempts {
                    error!(cp_id = %cp_id, "CPMS unreachable, giving up: {}", e);
                    return Err(RelayError::CpmsUnreachable { attempts });
                }
                warn!(
                    cp_id = %cp_id,
                    "CPMS connection failed ({}), retrying in {:?}",
                    e, delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, config.max_reconnect_delay());
            }
        }
    }
}

/// Connect the CPMS leg, reusing the charger's subprotocol and path suffix.
async fn dial_cpms(
    config: &RelayConfig,
    cpms_tls: &Option<native_tls::TlsConnector>,
    cp_id: &str,
    protocol: &str,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, RelayError> {
    let url = format!("{}/{}", config.cpms_url.trim_end_matches('/'), cp_id);
    let uri: Uri = url.parse().map_err(|source| RelayError::InvalidCpmsUrl {
        url: url.clone(),
        source,
    })?;

    // into_client_request generates the upgrade headers the handshake
    // requires; only the extras are set by hand.
    let mut request = uri.into_client_request()?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_str(protocol).map_err(http::Error::from)?,
    );
    if let (Some(username), Some(password)) = (&config.cpms_username, &config.cpms_password) {
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&basic_auth_header(username, password))
                .map_err(http::Error::from)?,
        );
    }

    let connector = cpms_tls.clone().map(Connector::NativeTls);
    let (ws, response) = connect_async_tls_with_config(request, None, false, connector).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(protocol) {
        warn!(
            "CPMS accepted subprotocol {:?}, charger requested {:?}",
            accepted, protocol
        );
    }

    info!("Connected to CPMS at {}", url);
    Ok(ws)
}

/// HTTP basic auth value for the CPMS handshake.
fn basic_auth_header(username: &str, password: &str) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

/// Snoop envelope payload for a binary frame.
fn binary_payload(bin: &[u8]) -> Value {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    Value::String(STANDARD.encode(bin))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        // RFC 7617 example pair
        assert_eq!(
            basic_auth_header("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn test_binary_payload() {
        assert_eq!(binary_payload(&[0x01, 0x02]), Value::String("AQI=".into()));
        assert_eq!(binary_payload(&[]), Value::String(String::new()));
    }
}
