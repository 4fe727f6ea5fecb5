//! Bus hub
//!
//! ```text
//!  publisher sockets            bus hub                 subscriber sockets
//!  ┌──────────────┐      ┌──────────────────────┐      ┌──────────────────┐
//!  │ ingest (pub) │─────►│ reader task          │      │ score (sub)      │
//!  └──────────────┘      │   │                  │ ┌───►└──────────────────┘
//!  ┌──────────────┐      │   ▼                  │ │    ┌──────────────────┐
//!  │ score (pub)  │─────►│ SubscriptionTable    │─┼───►│ oracle (sub)     │
//!  └──────────────┘      │   │ route by prefix  │ │    └──────────────────┘
//!                        │   ▼                  │ │    ┌──────────────────┐
//!                        │ per-peer flume queue │─┴───►│ observe (sub)    │
//!                        └──────────────────────┘      └──────────────────┘
//! ```
//!
//! Every connection starts with a [`Hello`]. Subscribers are registered in the
//! table before their [`HelloAck`] is sent, so a plugin that has its ack
//! cannot miss a later frame because of a registration race. Frames from one
//! publisher are forwarded in arrival order; there is no order across
//! publishers. A full subscriber queue drops the frame for that subscriber
//! only (or waits up to the write timeout with [`DeliveryMode::WaitOnFull`]).

use bytes::Bytes;
use camtrap_client::{FrameCodec, Hello, HelloAck, Role, MAX_FRAME_SIZE};
use camtrap_core::config::DeliveryMode;
use camtrap_core::PipelineConfig;
use camtrap_filter::{SubscriberId, SubscriberRoute, SubscriptionSet, SubscriptionTable};
use dashmap::DashMap;
use flume::TrySendError;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::BusError;
use crate::metrics::BusMetrics;

type PeerStream = Framed<TcpStream, FrameCodec>;

/// Bus hub settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    /// Every port to listen on; 0 picks an ephemeral port
    pub ports: Vec<u16>,
    /// Outbound queue capacity per subscriber
    pub queue_capacity: usize,
    pub delivery: DeliveryMode,
    /// Socket write deadline, also the wait bound for `WaitOnFull`
    pub write_timeout: Duration,
    /// Time a new connection has to send its hello
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: vec![camtrap_core::types::DEFAULT_BUS_PORT],
            queue_capacity: 1024,
            delivery: DeliveryMode::DropOnFull,
            write_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl BrokerConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            host: config.bus.host.clone(),
            ports: config.bus_listen_ports(),
            queue_capacity: config.bus.queue_capacity,
            delivery: config.bus.delivery,
            write_timeout: config.transport.write_timeout(),
            handshake_timeout: config.transport.connect_timeout(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// One ephemeral loopback port, for tests and in-process pipelines
    pub fn ephemeral() -> Self {
        Self {
            ports: vec![0],
            ..Self::default()
        }
    }
}

/// Outbound side of one subscriber connection
struct Peer {
    plugin_name: String,
    tx: flume::Sender<Bytes>,
}

/// Routing state shared by every connection task
pub struct Broker {
    config: BrokerConfig,
    table: SubscriptionTable,
    peers: DashMap<SubscriberId, Peer>,
    next_id: AtomicU64,
    metrics: Arc<BusMetrics>,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: SubscriptionTable::new(),
            peers: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics: Arc::new(BusMetrics::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds every configured port and starts accepting plugins
    pub async fn start(config: BrokerConfig) -> Result<BusHandle, BusError> {
        let broker = Self::new(config);

        let mut listeners = Vec::with_capacity(broker.config.ports.len());
        for port in &broker.config.ports {
            let addr = format!("{}:{}", broker.config.host, port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| BusError::Bind {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
            listeners.push(listener);
        }

        let mut local_addrs = Vec::with_capacity(listeners.len());
        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let addr = listener.local_addr()?;
            info!(address = %addr, "Bus hub listening");
            local_addrs.push(addr);
            tasks.push(tokio::spawn(Arc::clone(&broker).accept_loop(listener)));
        }

        Ok(BusHandle {
            broker,
            local_addrs,
            tasks,
        })
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn subscriber_count(&self) -> usize {
        self.table.len()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "Accepted connection");
                        tokio::spawn(Arc::clone(&self).handle_connection(stream, peer_addr));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let mut framed = Framed::new(stream, FrameCodec::new(self.config.max_frame_size));

        let hello = match timeout(self.config.handshake_timeout, framed.next()).await {
            Ok(Some(Ok(frame))) => match Hello::from_frame(&frame) {
                Ok(hello) => hello,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "Invalid hello, closing connection");
                    return;
                }
            },
            Ok(Some(Err(e))) => {
                warn!(peer = %peer_addr, error = %e, "Read error during handshake");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(peer = %peer_addr, "Handshake timed out");
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match hello.role {
            Role::Publisher => self.serve_publisher(id, hello, framed).await,
            Role::Subscriber => self.serve_subscriber(id, hello, framed).await,
        }
    }

    async fn send_ack(&self, id: SubscriberId, framed: &mut PeerStream) -> bool {
        let ack = match (HelloAck { connection_id: id }).to_frame() {
            Ok(ack) => ack,
            Err(e) => {
                error!(connection = id, error = %e, "Failed to encode hello ack");
                return false;
            }
        };
        match timeout(self.config.write_timeout, framed.send(ack)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(connection = id, error = %e, "Failed to send hello ack");
                false
            }
            Err(_) => {
                warn!(connection = id, "Timed out sending hello ack");
                false
            }
        }
    }

    async fn serve_publisher(&self, id: SubscriberId, hello: Hello, mut framed: PeerStream) {
        if !self.send_ack(id, &mut framed).await {
            return;
        }
        info!(connection = id, plugin = %hello.plugin_name, "Publisher connected");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = framed.next() => match next {
                    Some(Ok(frame)) => self.forward(id, frame).await,
                    Some(Err(e)) => {
                        warn!(connection = id, plugin = %hello.plugin_name, error = %e, "Publisher read error");
                        break;
                    }
                    None => break,
                }
            }
        }

        info!(connection = id, plugin = %hello.plugin_name, "Publisher disconnected");
    }

    async fn serve_subscriber(&self, id: SubscriberId, hello: Hello, mut framed: PeerStream) {
        let subscriptions = SubscriptionSet::from_prefixes(hello.subscriptions);
        let (tx, rx) = flume::bounded(self.config.queue_capacity);

        self.table
            .add(SubscriberRoute::new(id, hello.plugin_name.clone(), subscriptions));
        self.peers.insert(
            id,
            Peer {
                plugin_name: hello.plugin_name.clone(),
                tx,
            },
        );
        self.metrics.record_subscriber_connected();

        if self.send_ack(id, &mut framed).await {
            info!(connection = id, plugin = %hello.plugin_name, "Subscriber connected");

            let write_timeout = self.config.write_timeout;
            let (mut sink, mut stream) = framed.split();

            let writer = async {
                while let Ok(frame) = rx.recv_async().await {
                    match timeout(write_timeout, sink.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(connection = id, error = %e, "Subscriber write error");
                            break;
                        }
                        Err(_) => {
                            warn!(connection = id, "Subscriber write timed out");
                            break;
                        }
                    }
                }
            };

            // Subscribers never publish; reading only detects the close.
            let reader = async {
                while let Some(next) = stream.next().await {
                    match next {
                        Ok(_) => debug!(connection = id, "Ignoring frame from subscriber socket"),
                        Err(e) => {
                            debug!(connection = id, error = %e, "Subscriber read error");
                            break;
                        }
                    }
                }
            };

            tokio::select! {
                _ = writer => {}
                _ = reader => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        self.table.remove(id);
        self.peers.remove(&id);
        self.metrics.record_subscriber_disconnected();
        info!(connection = id, plugin = %hello.plugin_name, "Subscriber disconnected");
    }

    /// Queues `frame` for every subscriber whose prefixes match it
    pub async fn forward(&self, origin: SubscriberId, frame: Bytes) {
        let start = Instant::now();
        self.metrics.record_frame_received();

        let routing = self.table.route(&frame, Some(origin));
        trace!(
            origin,
            kind = ?camtrap_events::wire::peek_kind(&frame).ok(),
            destinations = routing.destinations.len(),
            "Routing frame"
        );

        for id in routing.destinations {
            // Clone the sender out so no map guard is held across an await.
            let (plugin_name, tx) = match self.peers.get(&id) {
                Some(peer) => (peer.plugin_name.clone(), peer.tx.clone()),
                None => continue,
            };

            match self.config.delivery {
                DeliveryMode::DropOnFull => match tx.try_send(frame.clone()) {
                    Ok(()) => self.metrics.record_forwarded(),
                    Err(TrySendError::Full(_)) => {
                        self.metrics.record_dropped();
                        debug!(subscriber = id, plugin = %plugin_name, "Subscriber queue full, dropping frame");
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                },
                DeliveryMode::WaitOnFull => {
                    match timeout(self.config.write_timeout, tx.send_async(frame.clone())).await {
                        Ok(Ok(())) => self.metrics.record_forwarded(),
                        Ok(Err(_)) => {}
                        Err(_) => {
                            self.metrics.record_dropped();
                            warn!(subscriber = id, plugin = %plugin_name, "Subscriber queue stayed full, dropping frame");
                        }
                    }
                }
            }
        }

        self.metrics.record_forward_latency(start.elapsed());
    }
}

/// A running bus hub
pub struct BusHandle {
    broker: Arc<Broker>,
    local_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusHandle {
    /// Bound addresses, in the order of `BrokerConfig::ports`
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        self.broker.metrics()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broker.subscriber_count()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Stops accepting and closes every connection
    pub fn shutdown(&self) {
        self.broker.shutdown.cancel();
    }

    /// Waits for the accept loops to finish
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
        info!(
            received = self.broker.metrics.frames_received(),
            forwarded = self.broker.metrics.frames_forwarded(),
            dropped = self.broker.metrics.frames_dropped(),
            "Bus hub stopped"
        );
    }
}
