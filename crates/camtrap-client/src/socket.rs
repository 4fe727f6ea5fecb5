//! Publisher and subscriber sockets connected to the bus hub.
//!
//! A [`Socket`] owns a background task holding the TCP connection. `publish`
//! queues a frame for that task; the reader side pushes frames into a bounded
//! queue that `receive` drains. When the connection drops, the task
//! reconnects with exponential backoff and re-sends the handshake, so
//! subscriptions survive a bus restart. Frames in flight during the outage
//! may be lost: delivery is best-effort.

use crate::client::{calculate_backoff, ClientConfig};
use crate::error::{RecvError, TransportError};
use crate::framing::FrameCodec;
use crate::handshake::{Hello, HelloAck, Role};
use crate::state::{LinkState, LinkStatus};
use bytes::Bytes;
use camtrap_core::PluginIdentity;
use camtrap_filter::SubscriptionSet;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type BusStream = Framed<TcpStream, FrameCodec>;

/// Local acknowledgement of a publish: the frame is queued for the writer.
/// It says nothing about delivery to any subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// 1-based count of frames queued on this socket
    pub sequence: u64,
}

/// One connection to the bus hub
pub struct Socket {
    role: Role,
    connection_id: u64,
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<Result<Bytes, TransportError>>,
    status: Arc<LinkStatus>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    sequence: AtomicU64,
    write_timeout: Duration,
    max_frame_size: usize,
}

impl Socket {
    /// Connects to the bus and performs the handshake.
    ///
    /// Retries per `config.reconnect` before giving up. Once this returns,
    /// a subscriber's prefixes are registered with the bus.
    #[instrument(skip_all, fields(bus = %config.bus_addr, plugin = %identity.name, role = %role))]
    pub async fn connect(
        config: ClientConfig,
        identity: &PluginIdentity,
        role: Role,
        subscriptions: SubscriptionSet,
    ) -> Result<Self, TransportError> {
        let hello = Hello {
            plugin_name: identity.name.clone(),
            plugin_uuid: identity.uuid,
            role,
            subscriptions: match role {
                Role::Subscriber => subscriptions.to_prefixes(),
                Role::Publisher => Vec::new(),
            },
        };

        let status = Arc::new(LinkStatus::new());
        let shutdown = CancellationToken::new();

        let (stream, connection_id) =
            match establish_with_retry(&config, &hello, &status, &shutdown).await {
                Ok(connected) => connected,
                Err(e) => {
                    status.set_state(LinkState::Failed);
                    return Err(e);
                }
            };

        status.mark_connected();
        info!(connection_id, "Connected to bus");

        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.recv_queue_capacity.max(1));

        let write_timeout = config.write_timeout;
        let max_frame_size = config.max_frame_size;
        let connection = Connection {
            config,
            hello,
            status: Arc::clone(&status),
            outbound: outbound_rx,
            inbound: inbound_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(connection.run(stream));

        Ok(Self {
            role,
            connection_id,
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            status,
            shutdown,
            task: Some(task),
            sequence: AtomicU64::new(0),
            write_timeout,
            max_frame_size,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Id the bus assigned to the first connection
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    /// Queues a frame for sending.
    ///
    /// Waits up to the write timeout for queue space.
    pub async fn publish(&self, frame: impl Into<Bytes>) -> Result<Ack, TransportError> {
        if self.role != Role::Publisher {
            return Err(TransportError::WrongRole(self.role.as_str()));
        }
        let frame = frame.into();
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_size,
            });
        }
        if self.status.is_failed() {
            return Err(TransportError::Closed);
        }
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;

        timeout(self.write_timeout, outbound.send(frame))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "publish",
                timeout_ms: self.write_timeout.as_millis() as u64,
            })?
            .map_err(|_| TransportError::Closed)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Ack { sequence })
    }

    /// Waits for the next frame. `Duration::ZERO` waits forever.
    pub async fn receive(&mut self, wait: Duration) -> Result<Bytes, RecvError> {
        if self.role != Role::Subscriber {
            return Err(TransportError::WrongRole(self.role.as_str()).into());
        }

        let next = if wait.is_zero() {
            self.inbound.recv().await
        } else {
            timeout(wait, self.inbound.recv())
                .await
                .map_err(|_| RecvError::Timeout)?
        };

        match next {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed.into()),
        }
    }

    /// Takes a frame that already arrived, without waiting.
    pub fn try_receive(&mut self) -> Result<Option<Bytes>, RecvError> {
        if self.role != Role::Subscriber {
            return Err(TransportError::WrongRole(self.role.as_str()).into());
        }
        match self.inbound.try_recv() {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(e)) => Err(e.into()),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Closed.into()),
        }
    }

    /// Flushes queued frames and closes the connection.
    pub async fn close(mut self) {
        self.outbound.take();
        if let Some(task) = self.task.take() {
            if timeout(self.write_timeout, task).await.is_err() {
                warn!("Bus socket did not flush before the write timeout");
            }
        }
        self.shutdown.cancel();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.shutdown.cancel();
        }
    }
}

enum SessionEnd {
    /// Socket closed or dropped
    Finished,
    Lost(String),
}

/// State owned by the background connection task
struct Connection {
    config: ClientConfig,
    hello: Hello,
    status: Arc<LinkStatus>,
    outbound: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<Result<Bytes, TransportError>>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(mut self, mut stream: BusStream) {
        loop {
            match self.session(&mut stream).await {
                SessionEnd::Finished => break,
                SessionEnd::Lost(reason) => {
                    warn!(plugin = %self.hello.plugin_name, reason = %reason, "Lost connection to bus");
                    let _ = self
                        .inbound
                        .try_send(Err(TransportError::Disconnected(reason)));

                    if !self.config.reconnect.enabled {
                        self.status.set_state(LinkState::Failed);
                        return;
                    }

                    self.status.set_state(LinkState::Reconnecting);
                    match establish_with_retry(&self.config, &self.hello, &self.status, &self.shutdown)
                        .await
                    {
                        Ok((next, connection_id)) => {
                            info!(connection_id, "Reconnected to bus");
                            self.status.mark_connected();
                            stream = next;
                        }
                        Err(e) => {
                            error!(error = %e, "Bus did not come back");
                            self.status.set_state(LinkState::Failed);
                            return;
                        }
                    }
                }
            }
        }

        self.status.set_state(LinkState::Closed);
    }

    async fn session(&mut self, stream: &mut BusStream) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Connection task shutting down");
                    return SessionEnd::Finished;
                }
                outgoing = self.outbound.recv() => match outgoing {
                    Some(frame) => {
                        match timeout(self.config.write_timeout, stream.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => return SessionEnd::Lost(e.to_string()),
                            Err(_) => return SessionEnd::Lost("write timeout".to_string()),
                        }
                    }
                    None => {
                        // Every queued frame was written by now.
                        let _ = SinkExt::<Bytes>::close(stream).await;
                        return SessionEnd::Finished;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(frame)) => {
                        self.status.record_received();
                        match self.inbound.try_send(Ok(frame)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                self.status.record_dropped();
                                debug!("Receive queue full, dropping frame");
                            }
                            Err(TrySendError::Closed(_)) => return SessionEnd::Finished,
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("closed by bus".to_string()),
                },
            }
        }
    }
}

fn configure_socket(stream: &TcpStream, keepalive: bool) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    if keepalive {
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
        socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

async fn establish(config: &ClientConfig, hello: &Hello) -> Result<(BusStream, u64), TransportError> {
    let connect_timeout_ms = config.connect_timeout.as_millis() as u64;

    let stream = timeout(config.connect_timeout, TcpStream::connect(&config.bus_addr))
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "connect",
            timeout_ms: connect_timeout_ms,
        })?
        .map_err(|e| TransportError::Connect {
            addr: config.bus_addr.clone(),
            reason: e.to_string(),
        })?;
    configure_socket(&stream, config.keepalive)?;

    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_size));
    let hello_frame = hello
        .to_frame()
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    framed.send(hello_frame).await?;

    let reply = timeout(config.connect_timeout, framed.next())
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "handshake",
            timeout_ms: connect_timeout_ms,
        })?;
    let ack = match reply {
        Some(Ok(frame)) => {
            HelloAck::from_frame(&frame).map_err(|e| TransportError::Handshake(e.to_string()))?
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(TransportError::Handshake("bus closed the connection".to_string())),
    };

    Ok((framed, ack.connection_id))
}

async fn establish_with_retry(
    config: &ClientConfig,
    hello: &Hello,
    status: &LinkStatus,
    shutdown: &CancellationToken,
) -> Result<(BusStream, u64), TransportError> {
    let policy = &config.reconnect;
    let mut attempt = 0u32;

    loop {
        match establish(config, hello).await {
            Ok(connected) => {
                if attempt > 0 {
                    info!(attempt, "Connected to bus after {} attempts", attempt);
                }
                return Ok(connected);
            }
            Err(e) => {
                attempt += 1;

                let exhausted = policy.max_attempts.is_some_and(|max| attempt >= max);
                if !policy.enabled || exhausted {
                    error!(attempt, error = %e, "Giving up on bus connection");
                    return Err(e);
                }

                let backoff = calculate_backoff(attempt - 1, policy);
                warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Bus connection attempt failed, retrying after backoff"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => return Err(TransportError::Closed),
                    _ = tokio::time::sleep(backoff) => {}
                }
                status.record_reconnect();
            }
        }
    }
}
