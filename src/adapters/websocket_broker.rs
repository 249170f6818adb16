//! Websocket broker link.
//!
//! One long-lived connection carries JSON [`ActionMessage`] text frames both
//! ways. Each connection gets a read pump and a write pump; either one asks
//! the supervisor for a reconnect through a capacity-1 channel, tagged with
//! the connection generation so stale requests from a dead link are ignored.
//! The outbound queue outlives connections, so messages published while the
//! link is reconnecting go out once it is back.
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::BrokerLinkConfig,
    core::{
        actions::{ActionMessage, HandlerTable, run_handlers},
        errors::{RuntimeError, RuntimeResult},
        lifecycle::LifecycleState,
    },
    metrics,
    ports::{broker::ActionBroker, component::Component},
};

pub const BROKER_SOURCE: &str = "websocket-broker";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Reconnecting = 4,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Starting,
            2 => LinkState::Running,
            3 => LinkState::Stopping,
            4 => LinkState::Reconnecting,
            _ => LinkState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Stopped => "stopped",
            LinkState::Starting => "starting",
            LinkState::Running => "running",
            LinkState::Stopping => "stopping",
            LinkState::Reconnecting => "reconnecting",
        }
    }
}

struct Shared {
    config: BrokerLinkConfig,
    handlers: Arc<HandlerTable>,
    state: AtomicU8,
    attempts: AtomicU32,
    queue: tokio::sync::Mutex<mpsc::Receiver<ActionMessage>>,
    reconnect_tx: mpsc::Sender<u64>,
    reconnect_rx: tokio::sync::Mutex<mpsc::Receiver<u64>>,
}

impl Shared {
    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_live(&self) -> bool {
        matches!(self.state(), LinkState::Running | LinkState::Reconnecting)
    }

    /// Ask for a reconnect without blocking; a pending request already covers us.
    fn trigger_reconnect(&self, generation: u64) {
        let _ = self.reconnect_tx.try_send(generation);
    }

    async fn dial(&self) -> RuntimeResult<Socket> {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.config.dial_timeout,
            tokio_tungstenite::connect_async(self.config.url.as_str()),
        )
        .await;
        match result {
            Ok(Ok((socket, _response))) => {
                metrics::record_websocket_operation("connect", "success", "", start.elapsed());
                tracing::info!(url = %self.config.url, "Connected to broker");
                Ok(socket)
            }
            Ok(Err(e)) => {
                metrics::record_websocket_operation("connect", "error", "", start.elapsed());
                Err(RuntimeError::wrap(
                    format!("failed to connect to broker at {}", self.config.url),
                    e,
                ))
            }
            Err(_) => {
                metrics::record_websocket_operation("connect", "timeout", "", start.elapsed());
                Err(RuntimeError::TimedOut(format!(
                    "broker dial to {} exceeded {:?}",
                    self.config.url, self.config.dial_timeout
                )))
            }
        }
    }
}

/// Pumps of one live connection.
struct Connection {
    generation: u64,
    cancel: CancellationToken,
    read: JoinHandle<()>,
    write: JoinHandle<()>,
}

impl Connection {
    fn open(shared: &Arc<Shared>, socket: Socket, generation: u64, root: &CancellationToken) -> Self {
        let cancel = root.child_token();
        let (sink, stream) = socket.split();
        let read = tokio::spawn(read_pump(
            shared.clone(),
            stream,
            generation,
            cancel.clone(),
            root.clone(),
        ));
        let write = tokio::spawn(write_pump(shared.clone(), sink, generation, cancel.clone()));
        Self {
            generation,
            cancel,
            read,
            write,
        }
    }

    async fn close(self) {
        self.cancel.cancel();
        let _ = self.read.await;
        let _ = self.write.await;
    }
}

struct RunHandle {
    root: CancellationToken,
    supervisor: JoinHandle<()>,
}

pub struct WebSocketBroker {
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<ActionMessage>,
    parent: CancellationToken,
    run: Mutex<Option<RunHandle>>,
}

impl WebSocketBroker {
    /// Build a link dispatching inbound messages to `handlers`. Tasks are bound to `parent`.
    pub fn new(config: BrokerLinkConfig, handlers: Arc<HandlerTable>, parent: CancellationToken) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                handlers,
                state: AtomicU8::new(LinkState::Stopped as u8),
                attempts: AtomicU32::new(0),
                queue: tokio::sync::Mutex::new(queue_rx),
                reconnect_tx,
                reconnect_rx: tokio::sync::Mutex::new(reconnect_rx),
            }),
            queue_tx,
            parent,
            run: Mutex::new(None),
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.shared.state()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Component for WebSocketBroker {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .shared
            .transition(LinkState::Stopped, LinkState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }

        let socket = match self.shared.dial().await {
            Ok(socket) => socket,
            Err(e) => {
                self.shared.set_state(LinkState::Stopped);
                tracing::error!("Failed to establish initial broker connection: {}", e);
                return Err(RuntimeError::wrap(
                    "failed to establish initial connection",
                    e,
                ));
            }
        };

        let root = self.parent.child_token();
        self.shared.attempts.store(0, Ordering::Release);
        let connection = Connection::open(&self.shared, socket, 0, &root);
        self.shared.set_state(LinkState::Running);
        let supervisor = tokio::spawn(supervise(self.shared.clone(), connection, root.clone()));
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunHandle { root, supervisor });
        tracing::info!(url = %self.shared.config.url, "Websocket broker started");
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .shared
            .transition(LinkState::Running, LinkState::Stopping)
            && !self
                .shared
                .transition(LinkState::Reconnecting, LinkState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }

        let run = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(run) = run {
            run.root.cancel();
            let grace = self.shared.config.write_wait;
            if tokio::time::timeout(grace, run.supervisor).await.is_err() {
                tracing::warn!("Broker tasks did not stop within {:?}", grace);
            }
        }

        let mut dropped = 0usize;
        if let Ok(mut queue) = self.shared.queue.try_lock() {
            while queue.try_recv().is_ok() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "Discarded unsent broker messages on stop");
        }
        self.shared.set_state(LinkState::Stopped);
        tracing::info!("Websocket broker stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        match self.shared.state() {
            LinkState::Stopped => LifecycleState::Stopped,
            LinkState::Starting => LifecycleState::Starting,
            LinkState::Running | LinkState::Reconnecting => LifecycleState::Running,
            LinkState::Stopping => LifecycleState::Stopping,
        }
    }
}

impl ActionBroker for WebSocketBroker {
    fn broker_type(&self) -> &'static str {
        "websocket"
    }

    fn publish(&self, message: ActionMessage) -> RuntimeResult<()> {
        if !self.shared.is_live() {
            return Err(RuntimeError::NotRunning);
        }
        let action = message.action.clone();
        match self.queue_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_websocket_operation("publish", "dropped", &action, Duration::ZERO);
                tracing::warn!(action, "Broker send queue full, message dropped");
                Err(RuntimeError::PublishFailed(format!(
                    "broker send queue full, dropped {action}"
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RuntimeError::PublishFailed(
                "broker send queue closed".to_string(),
            )),
        }
    }

    fn queued(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }
}

async fn supervise(shared: Arc<Shared>, first: Connection, root: CancellationToken) {
    let mut reconnects = shared.reconnect_rx.lock().await;
    while reconnects.try_recv().is_ok() {}
    let mut current = Some(first);
    let mut generation = 0u64;

    loop {
        let requested = tokio::select! {
            _ = root.cancelled() => break,
            requested = reconnects.recv() => requested,
        };
        let Some(requested) = requested else { break };
        if requested != generation || !shared.is_live() {
            continue;
        }
        shared.transition(LinkState::Running, LinkState::Reconnecting);
        if let Some(connection) = current.take() {
            connection.close().await;
        }

        let attempt = shared.attempts.load(Ordering::Acquire);
        if attempt >= shared.config.max_retries {
            tracing::error!(
                max_retries = shared.config.max_retries,
                "Max broker reconnection attempts reached, stopping link"
            );
            if shared.transition(LinkState::Reconnecting, LinkState::Stopping) {
                root.cancel();
                shared.set_state(LinkState::Stopped);
            }
            break;
        }
        tracing::info!(
            attempt = attempt + 1,
            max_retries = shared.config.max_retries,
            "Reconnecting to broker"
        );

        tokio::select! {
            _ = root.cancelled() => break,
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
        shared.attempts.fetch_add(1, Ordering::AcqRel);

        let dialed = tokio::select! {
            _ = root.cancelled() => break,
            dialed = shared.dial() => dialed,
        };
        match dialed {
            Ok(socket) => {
                generation += 1;
                shared.attempts.store(0, Ordering::Release);
                if !shared.transition(LinkState::Reconnecting, LinkState::Running) {
                    break;
                }
                current = Some(Connection::open(&shared, socket, generation, &root));
                tracing::info!(generation, "Reconnected to broker");
            }
            Err(e) => {
                tracing::error!(
                    attempt = shared.attempts.load(Ordering::Acquire),
                    "Broker reconnection attempt failed: {}",
                    e
                );
                shared.trigger_reconnect(generation);
            }
        }
    }

    if let Some(connection) = current.take() {
        connection.close().await;
    }
    tracing::debug!("Broker supervisor stopped");
}

async fn read_pump(
    shared: Arc<Shared>,
    mut stream: SplitStream<Socket>,
    generation: u64,
    cancel: CancellationToken,
    root: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = tokio::time::timeout(shared.config.pong_wait, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                tracing::warn!(generation, "No frame from broker within {:?}", shared.config.pong_wait);
                break;
            }
            Ok(None) => {
                tracing::warn!(generation, "Broker connection closed");
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(generation, "Broker read failed: {}", e);
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                let start = Instant::now();
                match serde_json::from_str::<ActionMessage>(text.as_str()) {
                    Ok(message) => {
                        metrics::record_websocket_operation("receive", "success", &message.action, start.elapsed());
                        tracing::debug!(
                            action = %message.action,
                            message_id = %message.message_id,
                            source = %message.source,
                            "Broker message received"
                        );
                        let handlers = shared.handlers.clone();
                        let deadline = shared.config.handler_timeout;
                        let root = root.clone();
                        tokio::spawn(async move {
                            run_handlers(&handlers, message, deadline, &root).await;
                        });
                    }
                    Err(e) => {
                        metrics::record_websocket_operation("receive", "decode_error", "", start.elapsed());
                        tracing::warn!("Discarding undecodable broker frame: {}", e);
                    }
                }
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                tracing::info!(generation, ?frame, "Broker sent close frame");
                break;
            }
            Ok(Some(Ok(_))) => {}
        }
    }
    shared.trigger_reconnect(generation);
}

async fn write_pump(
    shared: Arc<Shared>,
    mut sink: SplitSink<Socket, Message>,
    generation: u64,
    cancel: CancellationToken,
) {
    let write_wait = shared.config.write_wait;
    let mut queue = tokio::select! {
        _ = cancel.cancelled() => return,
        queue = shared.queue.lock() => queue,
    };
    let mut ticker = tokio::time::interval(shared.config.ping_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(write_wait, sink.send(Message::Close(None))).await;
                return;
            }
            next = queue.recv() => {
                let Some(message) = next else { return };
                let start = Instant::now();
                let payload = match serde_json::to_string(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(action = %message.action, "Failed to encode broker message: {}", e);
                        continue;
                    }
                };
                match tokio::time::timeout(write_wait, sink.send(Message::Text(payload.into()))).await {
                    Ok(Ok(())) => {
                        metrics::record_websocket_operation("publish", "success", &message.action, start.elapsed());
                    }
                    Ok(Err(e)) => {
                        metrics::record_websocket_operation("publish", "error", &message.action, start.elapsed());
                        tracing::warn!(generation, action = %message.action, "Broker write failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        metrics::record_websocket_operation("publish", "timeout", &message.action, start.elapsed());
                        tracing::warn!(generation, action = %message.action, "Broker write exceeded {:?}", write_wait);
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                match tokio::time::timeout(write_wait, sink.send(Message::Ping(Default::default()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        tracing::warn!(generation, "Broker ping failed");
                        break;
                    }
                }
            }
        }
    }
    drop(queue);
    shared.trigger_reconnect(generation);
}
