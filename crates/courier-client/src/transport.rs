//! Socket transport.
//!
//! [`Transport`] is what [`crate::ChatClient`] talks to: fire-and-forget
//! emits and requests answered by an ack frame. [`WsTransport`] is the
//! tokio-tungstenite implementation; it keeps reconnecting with capped
//! exponential backoff and reports every status change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use courier_shared::protocol::{AckFrame, ClientEvent, ClientFrame, ServerEvent, ServerFrame};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::model::ConnectionStatus;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an event without waiting for an answer.
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError>;

    /// Send an event and wait for its ack. Resolves to the ack data, or
    /// [`ClientError::Rejected`] when the ack carries an error.
    async fn request(&self, event: ClientEvent) -> Result<Value, ClientError>;

    fn is_connected(&self) -> bool;
}

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    Event(ServerEvent),
}

/// Delay before reconnect attempt `attempt` (1-based): exponential from
/// `min`, capped at `max`, with the upper half randomized.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
    let exp = min.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(max);
    let half = capped / 2;
    let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(jitter_ms)
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckFrame>>>>;

struct Shared {
    config: ClientConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    connected: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    fn report(&self, status: ConnectionStatus) {
        self.connected
            .store(status.is_connected(), Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Status(status));
    }

    async fn send_text(&self, text: String) -> Result<(), ClientError> {
        let outbound = self.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Route one inbound text frame: acks to their waiter, events to the
    /// owner.
    async fn dispatch_incoming(&self, text: &str) {
        match ServerFrame::parse(text) {
            Ok(ServerFrame::Ack(ack)) => {
                let waiter = self.pending.lock().await.remove(&ack.ack);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => debug!(ack = ack.ack, "ack without waiter"),
                }
            }
            Ok(ServerFrame::Event(event)) => {
                let _ = self.events.send(TransportEvent::Event(event));
            }
            Err(e) => warn!(error = %e, "undecodable server frame"),
        }
    }

    /// Forget the socket. Waiters see their sender dropped and fail with
    /// `NotConnected`.
    async fn detach(&self) {
        *self.outbound.lock().await = None;
        self.pending.lock().await.clear();
    }
}

pub struct WsTransport {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl WsTransport {
    /// Start the connection supervisor. Status changes and server events
    /// arrive on the returned receiver.
    pub fn connect(config: ClientConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            outbound: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_ack: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            events,
        });

        tokio::spawn(supervise(shared.clone(), shutdown_rx));
        (Arc::new(Self { shared, shutdown }), rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        let text = ClientFrame::new(event, None).to_text()?;
        self.shared.send_text(text).await
    }

    async fn request(&self, event: ClientEvent) -> Result<Value, ClientError> {
        let ack = self.shared.next_ack.fetch_add(1, Ordering::SeqCst);
        let text = ClientFrame::new(event, Some(ack)).to_text()?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(ack, tx);
        if let Err(e) = self.shared.send_text(text).await {
            self.shared.pending.lock().await.remove(&ack);
            return Err(e);
        }

        let timeout = self.shared.config.ack_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => match frame.error {
                Some(error) => Err(ClientError::Rejected(error)),
                None => Ok(frame.data),
            },
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&ack);
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.report(if attempt == 0 {
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Reconnecting(attempt)
        });

        match connect_async(shared.config.handshake_url()).await {
            Ok((socket, _)) => {
                info!(url = %shared.config.server_url, "connected");
                attempt = 0;
                run_socket(&shared, socket, &mut shutdown).await;
                shared.detach().await;
            }
            Err(tungstenite::Error::Http(response)) if response.status() == 401 => {
                warn!("credential rejected by server");
                shared.report(ConnectionStatus::Unauthenticated);
                return;
            }
            Err(e) => {
                debug!(error = %e, attempt, "connect failed");
            }
        }

        if *shutdown.borrow() {
            break;
        }
        attempt = attempt.saturating_add(1);
        shared.report(ConnectionStatus::Reconnecting(attempt));
        let delay = backoff_delay(attempt, shared.config.backoff_min, shared.config.backoff_max);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }
    shared.detach().await;
    shared.report(ConnectionStatus::Disconnected);
}

async fn run_socket<S>(
    shared: &Arc<Shared>,
    socket: tokio_tungstenite::WebSocketStream<S>,
    shutdown: &mut watch::Receiver<bool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *shared.outbound.lock().await = Some(tx);
    shared.report(ConnectionStatus::Connected);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(text) = outgoing else { break };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(error = %e, "socket write failed");
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => shared.dispatch_incoming(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                break;
            }
        }
    }
}
