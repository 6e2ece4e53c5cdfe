use async_trait::async_trait;
use chrono::Utc;
use gateway_core::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::*;

/// Configuration for connecting to MetaTrader 5.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaTraderConfig {
    /// Host address (e.g. "127.0.0.1").
    pub host: String,
    /// Port the MT5 EA/script is listening on.
    pub port: u16,
    /// Shared secret the EA expects in the hello message.
    pub api_key: Option<String>,
    /// How long to wait for the EA to answer a request.
    pub request_timeout_secs: u64,
}

impl Default for MetaTraderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
            api_key: None,
            request_timeout_secs: 10,
        }
    }
}

impl MetaTraderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<InboundMessage>>>>;

/// One open socket to the EA.
struct Link {
    writer: AsyncMutex<OwnedWriteHalf>,
    waiters: Waiters,
    reader: JoinHandle<()>,
}

impl Link {
    async fn send(&self, msg: &OutboundMessage) -> Result<(), VenueError> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| VenueError::Protocol(format!("Serialization error: {}", e)))?;
        let framed = frame_message(&json);
        self.writer
            .lock()
            .await
            .write_all(&framed)
            .await
            .map_err(|e| VenueError::Transport(format!("Write error: {}", e)))
    }
}

/// MetaTrader 5 venue adapter.
///
/// Communicates with an MQL5 EA running inside MT5 via TCP socket
/// using length-prefixed JSON messages. Requests are matched to replies by
/// `request_id`; everything else the EA sends is push traffic.
pub struct MetaTraderAdapter {
    config: MetaTraderConfig,
    link: Mutex<Option<Arc<Link>>>,
    next_request: AtomicU64,
}

impl MetaTraderAdapter {
    pub fn new(config: MetaTraderConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
            next_request: AtomicU64::new(1),
        }
    }

    fn link(&self) -> Result<Arc<Link>, VenueError> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| VenueError::Transport("Not connected".to_string()))
    }

    /// Send a request and wait for the EA's reply to it.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> OutboundMessage,
    ) -> Result<InboundMessage, VenueError> {
        let link = self.link()?;
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        link.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        let forget = || {
            link.waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
        };

        if let Err(e) = link.send(&build(request_id)).await {
            forget();
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Err(_) => {
                forget();
                Err(VenueError::Timeout)
            }
            Ok(Err(_)) => Err(VenueError::Transport("connection closed".to_string())),
            Ok(Ok(InboundMessage::Error { message, .. })) => Err(VenueError::Rejected(message)),
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    async fn expect_ack(&self, build: impl FnOnce(u64) -> OutboundMessage) -> Result<(), VenueError> {
        match self.request(build).await? {
            InboundMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn orders(&self, broker_order_id: Option<String>) -> Result<Vec<VenueOrder>, VenueError> {
        match self
            .request(|request_id| OutboundMessage::OrdersRequest {
                request_id,
                broker_order_id,
            })
            .await?
        {
            InboundMessage::Orders { orders, .. } => {
                orders.into_iter().map(VenueOrder::try_from).collect()
            }
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(msg: &InboundMessage) -> VenueError {
    VenueError::Protocol(format!("Unexpected reply: {:?}", msg))
}

/// Read frames until the socket closes, routing replies to their waiters
/// and normalizing push messages into the sink.
async fn read_loop(mut reader: OwnedReadHalf, waiters: Waiters, sink: VenueSink) {
    let reason = loop {
        let msg = match read_frame(&mut reader).await {
            Ok(msg) => msg,
            // The frame was consumed whole; skip it and keep the session.
            Err(VenueError::Protocol(e)) => {
                warn!(error = %e, "Undecodable MetaTrader message, skipping");
                continue;
            }
            Err(e) => break e.to_string(),
        };

        if let Some(request_id) = msg.request_id() {
            let waiter = waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => debug!(request_id, "Reply for unknown request"),
            }
            continue;
        }

        if let InboundMessage::Error { message, .. } = &msg {
            warn!(error = %message, "MetaTrader reported an error");
            continue;
        }
        if let Some(event) = msg.into_venue_event() {
            if sink.send(event).is_err() {
                return;
            }
        }
    };

    // Dropping the waiters wakes every pending request with a transport error.
    waiters.lock().unwrap_or_else(PoisonError::into_inner).clear();
    warn!(reason = %reason, "MetaTrader connection lost");
    let _ = sink.send(VenueEvent::TransportLost { reason });
}

#[async_trait]
impl VenueAdapter for MetaTraderAdapter {
    fn name(&self) -> &str {
        "MetaTrader"
    }

    async fn open(&self, sink: VenueSink) -> Result<(), VenueError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to MetaTrader at {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| VenueError::Transport(format!("TCP connect failed: {}", e)))?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = OutboundMessage::Hello {
            client: format!("gateway/{}", env!("CARGO_PKG_VERSION")),
            api_key: self.config.api_key.clone(),
        };
        let json = serde_json::to_vec(&hello)
            .map_err(|e| VenueError::Protocol(format!("Serialization error: {}", e)))?;
        writer
            .write_all(&frame_message(&json))
            .await
            .map_err(|e| VenueError::Transport(format!("Write error: {}", e)))?;

        // Wait for Connected message
        match read_frame(&mut reader).await? {
            InboundMessage::Connected { version } => {
                info!("Connected to MetaTrader EA v{}", version);
            }
            InboundMessage::Error { message, .. } => return Err(VenueError::Auth(message)),
            other => return Err(unexpected(&other)),
        }

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let link = Link {
            writer: AsyncMutex::new(writer),
            reader: tokio::spawn(read_loop(reader, waiters.clone(), sink)),
            waiters,
        };
        let previous = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(link));
        if let Some(previous) = previous {
            previous.reader.abort();
        }
        Ok(())
    }

    async fn close(&self) {
        let link = self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            link.reader.abort();
            let _ = link.writer.lock().await.shutdown().await;
            info!("Disconnected from MetaTrader");
        }
    }

    async fn heartbeat(&self) -> Result<(), VenueError> {
        match self
            .request(|request_id| OutboundMessage::Heartbeat {
                request_id,
                timestamp: Utc::now(),
            })
            .await?
        {
            InboundMessage::HeartbeatAck { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_account(&self) -> Result<Account, VenueError> {
        match self
            .request(|request_id| OutboundMessage::AccountRequest { request_id })
            .await?
        {
            InboundMessage::AccountUpdate { account, .. } => Ok(account.into()),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, VenueError> {
        match self
            .request(|request_id| OutboundMessage::PositionsRequest { request_id })
            .await?
        {
            InboundMessage::Positions { positions, .. } => {
                Ok(positions.into_iter().map(Position::from).collect())
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_open_orders(&self) -> Result<Vec<VenueOrder>, VenueError> {
        self.orders(None).await
    }

    async fn fetch_order(&self, venue_id: &str) -> Result<Option<VenueOrder>, VenueError> {
        match self.orders(Some(venue_id.to_string())).await {
            Ok(orders) => Ok(orders.into_iter().find(|o| o.venue_id == venue_id)),
            Err(VenueError::Rejected(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn submit_order(
        &self,
        correlation_id: CorrelationId,
        request: &OrderRequest,
    ) -> Result<(), VenueError> {
        self.expect_ack(|request_id| OutboundMessage::OrderSubmit {
            request_id,
            client_order_id: correlation_id.to_string(),
            instrument: request.symbol.clone(),
            side: side_str(request.side).to_string(),
            order_type: order_type_str(&request.order_type).to_string(),
            quantity: request.quantity,
            price: request.order_type.price(),
            time_in_force: time_in_force_str(request.time_in_force).to_string(),
        })
        .await
    }

    async fn amend_order(&self, venue_id: &str, amendment: &OrderAmendment) -> Result<(), VenueError> {
        self.expect_ack(|request_id| OutboundMessage::OrderModify {
            request_id,
            broker_order_id: venue_id.to_string(),
            quantity: amendment.quantity,
            price: amendment.price,
        })
        .await
    }

    async fn cancel_order(&self, venue_id: &str) -> Result<(), VenueError> {
        self.expect_ack(|request_id| OutboundMessage::OrderCancel {
            request_id,
            broker_order_id: venue_id.to_string(),
        })
        .await
    }

    async fn subscribe(&self, symbol: &str) -> Result<(), VenueError> {
        self.expect_ack(|request_id| OutboundMessage::Subscribe {
            request_id,
            instrument: symbol.to_string(),
        })
        .await
    }

    async fn unsubscribe(&self, symbol: &str) -> Result<(), VenueError> {
        self.expect_ack(|request_id| OutboundMessage::Unsubscribe {
            request_id,
            instrument: symbol.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn write(stream: &mut TcpStream, msg: &InboundMessage) {
        let body = serde_json::to_vec(msg).unwrap();
        stream.write_all(&frame_message(&body)).await.unwrap();
    }

    async fn read_outbound(stream: &mut TcpStream) -> OutboundMessage {
        use tokio::io::AsyncReadExt;
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// A fake EA that accepts one client and answers an account request.
    async fn fake_ea(listener: TcpListener, api_key: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        match read_outbound(&mut stream).await {
            OutboundMessage::Hello { api_key: Some(key), .. } if key == api_key => {
                write(&mut stream, &InboundMessage::Connected { version: "5.0".into() }).await;
            }
            _ => {
                write(
                    &mut stream,
                    &InboundMessage::Error {
                        request_id: None,
                        message: "bad api key".into(),
                    },
                )
                .await;
                return;
            }
        }

        let cid = CorrelationId::next();
        write(
            &mut stream,
            &InboundMessage::OrderUpdate {
                seq: 1,
                client_order_id: Some(cid.to_string()),
                broker_order_id: "777".into(),
                status: "accepted".into(),
                fill_quantity: None,
                fill_price: None,
                quantity: None,
                price: None,
                message: None,
                timestamp: Utc::now(),
            },
        )
        .await;

        if let OutboundMessage::AccountRequest { request_id } = read_outbound(&mut stream).await {
            write(
                &mut stream,
                &InboundMessage::AccountUpdate {
                    request_id: Some(request_id),
                    account: WireAccount {
                        login: "1001".into(),
                        currency: "USD".into(),
                        balance: dec!(10000),
                        equity: dec!(10050),
                        unrealized_pnl: dec!(50),
                        margin_used: dec!(200),
                        timestamp: Utc::now(),
                    },
                },
            )
            .await;
        }
        // Hold the socket open until the client goes away.
        let _ = read_outbound_or_eof(&mut stream).await;
    }

    async fn read_outbound_or_eof(stream: &mut TcpStream) -> Option<()> {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        stream.read(&mut buf).await.ok().map(|_| ())
    }

    async fn adapter_for(listener: &TcpListener, api_key: &str) -> MetaTraderAdapter {
        let port = listener.local_addr().unwrap().port();
        MetaTraderAdapter::new(MetaTraderConfig {
            port,
            api_key: Some(api_key.to_string()),
            request_timeout_secs: 2,
            ..MetaTraderConfig::default()
        })
    }

    #[tokio::test]
    async fn test_request_reply_and_push() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let adapter = adapter_for(&listener, "secret").await;
        let server = tokio::spawn(fake_ea(listener, "secret"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.open(tx).await.unwrap();

        match rx.recv().await {
            Some(VenueEvent::Accepted { venue_id, seq, .. }) => {
                assert_eq!(venue_id, "777");
                assert_eq!(seq, 1);
            }
            other => panic!("expected accept, got {other:?}"),
        }

        let account = adapter.fetch_account().await.unwrap();
        assert_eq!(account.id, "1001");
        assert_eq!(account.equity, dec!(10050));

        adapter.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_message_keeps_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let adapter = adapter_for(&listener, "secret").await;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_outbound(&mut stream).await;
            write(&mut stream, &InboundMessage::Connected { version: "5.0".into() }).await;
            stream
                .write_all(&frame_message(br#"{"type":"margin_call","level":80}"#))
                .await
                .unwrap();
            write(
                &mut stream,
                &InboundMessage::OrderUpdate {
                    seq: 4,
                    client_order_id: None,
                    broker_order_id: "901".into(),
                    status: "cancelled".into(),
                    fill_quantity: None,
                    fill_price: None,
                    quantity: None,
                    price: None,
                    message: None,
                    timestamp: Utc::now(),
                },
            )
            .await;
            let _ = read_outbound_or_eof(&mut stream).await;
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter.open(tx).await.unwrap();
        match rx.recv().await {
            Some(VenueEvent::Cancelled { order, seq }) => {
                assert_eq!(order, OrderRef::Venue("901".into()));
                assert_eq!(seq, 4);
            }
            other => panic!("expected cancel, got {other:?}"),
        }

        adapter.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_api_key_is_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let adapter = adapter_for(&listener, "wrong").await;
        let server = tokio::spawn(fake_ea(listener, "secret"));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(adapter.open(tx).await, Err(VenueError::Auth(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_fail_when_closed() {
        let adapter = MetaTraderAdapter::new(MetaTraderConfig::default());
        assert!(matches!(
            adapter.fetch_positions().await,
            Err(VenueError::Transport(_))
        ));
    }
}
