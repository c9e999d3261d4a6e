//! TCP transport: framed duplex streams and the accept loop

use crate::codec::{read_frame, write_frame, CodecError};
use crate::{Inbound, InboundSender, PeerConnector, PeerLink};
use async_trait::async_trait;
use pulse_core::{NodeId, PeerNode, SwarmResult, SwarmMessage, TransportConfig, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Read frames off `reader` into the inbound channel until EOF or a fatal
/// error. Frames from one connection are forwarded in arrival order.
pub async fn pump_frames(mut reader: OwnedReadHalf, remote: SocketAddr, inbound: InboundSender, max_frame: usize) {
    let mut last_sender: Option<NodeId> = None;
    loop {
        match read_frame(&mut reader, max_frame).await {
            Ok(Some(message)) => {
                last_sender = Some(message.sender_id.clone());
                if inbound.send(Inbound::Message(message)).is_err() {
                    debug!(%remote, "Inbound channel closed, stopping reader");
                    break;
                }
            }
            Ok(None) => {
                debug!(%remote, "Connection closed by peer");
                break;
            }
            Err(CodecError::Protocol(error)) => {
                let fatal = CodecError::Protocol(error.clone()).is_fatal();
                warn!(%remote, error = %error, fatal, "Rejected frame");
                let violation = Inbound::Violation {
                    peer_id: last_sender.clone(),
                    error,
                };
                if inbound.send(violation).is_err() || fatal {
                    break;
                }
            }
            Err(CodecError::Io(error)) => {
                debug!(%remote, error = %error, "Connection read failed");
                break;
            }
        }
    }
}

/// Listening side of the TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    inbound: InboundSender,
    max_frame: usize,
}

impl TcpTransport {
    /// Bind the listener.
    pub async fn bind(addr: SocketAddr, inbound: InboundSender, config: &TransportConfig) -> SwarmResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Unreachable {
                peer_id: addr.to_string(),
                reason: format!("bind failed: {e}"),
            })?;
        info!(address = %addr, "TCP transport listening");
        Ok(Self {
            listener,
            inbound,
            max_frame: config.max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> SwarmResult<SocketAddr> {
        self.listener.local_addr().map_err(|e| {
            TransportError::Unreachable {
                peer_id: "local".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Accept connections until shutdown, spawning one reader per connection.
    pub async fn run_accept_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "Accepted connection");
                        let (reader, _writer) = stream.into_split();
                        tokio::spawn(pump_frames(reader, remote, self.inbound.clone(), self.max_frame));
                    }
                    Err(error) => {
                        warn!(error = %error, "Accept failed");
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("TCP accept loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Opens outbound TCP links.
pub struct TcpConnector {
    connect_timeout: Duration,
    max_frame: usize,
    inbound: InboundSender,
}

impl TcpConnector {
    /// Replies arriving on outbound connections are fed into `inbound` too.
    pub fn new(config: &TransportConfig, inbound: InboundSender) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            max_frame: config.max_frame_bytes,
            inbound,
        }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, peer: &PeerNode) -> SwarmResult<Arc<dyn PeerLink>> {
        let unreachable = |reason: String| TransportError::Unreachable {
            peer_id: peer.id.clone(),
            reason,
        };
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer.address))
            .await
            .map_err(|_| unreachable(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| unreachable(e.to_string()))?;
        // latency matters more than throughput for small control frames
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        tokio::spawn(pump_frames(reader, peer.address, self.inbound.clone(), self.max_frame));

        Ok(Arc::new(TcpLink {
            peer_id: peer.id.clone(),
            writer: Mutex::new(writer),
            max_frame: self.max_frame,
        }))
    }
}

struct TcpLink {
    peer_id: NodeId,
    writer: Mutex<OwnedWriteHalf>,
    max_frame: usize,
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn send(&self, message: &SwarmMessage) -> SwarmResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, message, self.max_frame)
            .await
            .map_err(|e| match e {
                CodecError::Protocol(p) => p.into(),
                CodecError::Io(io) => TransportError::ConnectionReset {
                    peer_id: self.peer_id.clone(),
                    reason: io.to_string(),
                }
                .into(),
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inbound_channel, PeerRegistry};
    use futures_util::StreamExt;
    use pulse_core::{MessagePayload, NodeCapabilities};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_tcp_roundtrip_through_registry() {
        let (server_tx, mut server_in) = inbound_channel();
        let config = TransportConfig::default();
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), server_tx, &config)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(transport.run_accept_loop(shutdown_rx));

        let (client_tx, _client_in) = inbound_channel();
        let client_config = TransportConfig {
            node_id: "client".to_string(),
            ..Default::default()
        };
        let connector = TcpConnector::new(&client_config, client_tx);
        let registry = PeerRegistry::new(client_config, Arc::new(connector));
        registry.upsert(PeerNode::new("server", addr, NodeCapabilities::default()));

        let msg = SwarmMessage::new(
            "client",
            MessagePayload::Gossip {
                topic: "hello".to_string(),
                data: serde_json::json!([1, 2, 3]),
            },
        )
        .to("server");
        registry.send("server", &msg).await.unwrap();

        assert_eq!(server_in.next().await, Some(Inbound::Message(msg)));

        shutdown_tx.send(true).unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_on_socket_reports_violation() {
        let (server_tx, mut server_in) = inbound_channel();
        let config = TransportConfig::default();
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap(), server_tx, &config)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(transport.run_accept_loop(shutdown_rx));

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        match server_in.next().await {
            Some(Inbound::Violation { peer_id, .. }) => assert!(peer_id.is_none()),
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, _rx) = inbound_channel();
        let connector = TcpConnector::new(&TransportConfig::default(), tx);
        let peer = PeerNode::new("gone", addr, NodeCapabilities::default());
        let err = connector.connect(&peer).await.err().unwrap();
        assert!(err.is_retryable());
    }
}
