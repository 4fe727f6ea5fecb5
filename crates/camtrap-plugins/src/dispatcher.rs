//! Event dispatcher
//!
//! One dispatcher drives one plugin:
//!
//! ```text
//!  Starting ──► Running ──► Draining ──► Stopped
//!     │            │
//!     │            ├─ PluginTerminate for us (or "*")
//!     │            ├─ handler returns Flow::Complete
//!     │            ├─ too many consecutive idle timeouts
//!     │            └─ transport failure
//!     └─ PluginStarted published
//! ```
//!
//! Frames are decoded here; handlers only see typed [`Event`]s. Frames that
//! fail to decode are logged and dropped.

use async_trait::async_trait;
use bytes::Bytes;
use camtrap_client::{RecvError, Socket, TransportError};
use camtrap_core::config::DispatcherConfig;
use camtrap_core::{PipelineConfig, PluginIdentity};
use camtrap_events::{
    from_wire, to_wire, Event, PluginStarted, PluginTerminate, PluginTerminating,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::termination::is_addressed_to;

/// Lifecycle of a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// What a handler wants after processing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Complete,
}

/// Why `run` returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// A `PluginTerminate` addressed to this plugin arrived
    Terminated,
    /// The handler reported completion
    Completed,
    /// Nothing arrived for the configured number of poll timeouts
    IdleTimeout { timeouts: u32 },
    /// The bus connection failed
    TransportFailed(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Terminated => write!(f, "terminated"),
            ExitReason::Completed => write!(f, "completed"),
            ExitReason::IdleTimeout { timeouts } => {
                write!(f, "idle after {timeouts} consecutive timeouts")
            }
            ExitReason::TransportFailed(reason) => write!(f, "transport failed: {reason}"),
        }
    }
}

/// Reaction to receive timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    WaitForever,
    /// Stop after this many consecutive timeouts
    ExitAfter(u32),
}

impl IdlePolicy {
    pub fn from_limit(limit: Option<u32>) -> Self {
        match limit {
            Some(max) if max > 0 => IdlePolicy::ExitAfter(max),
            _ => IdlePolicy::WaitForever,
        }
    }
}

/// What a handler can reach while processing: its identity, the pipeline
/// configuration and the publisher socket.
pub struct PluginContext {
    identity: PluginIdentity,
    config: Arc<PipelineConfig>,
    publisher: Socket,
    terminating_sent: bool,
    published: u64,
}

impl PluginContext {
    pub fn new(identity: PluginIdentity, config: Arc<PipelineConfig>, publisher: Socket) -> Self {
        Self {
            identity,
            config,
            publisher,
            terminating_sent: false,
            published: 0,
        }
    }

    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Events published so far
    pub fn published(&self) -> u64 {
        self.published
    }

    pub async fn publish(&mut self, event: impl Into<Event>) -> PluginResult<()> {
        let event = event.into();
        let kind = event.kind();
        self.publisher.publish(to_wire(&event)).await?;
        self.published += 1;
        debug!(plugin = %self.identity.name, kind = %kind, "Published event");
        Ok(())
    }

    /// Publishes `PluginTerminating` for this plugin, at most once
    pub async fn announce_terminating(&mut self) -> PluginResult<()> {
        if self.terminating_sent {
            return Ok(());
        }
        let event = PluginTerminating::new(self.identity.name.clone(), self.identity.uuid);
        self.publish(event).await?;
        self.terminating_sent = true;
        Ok(())
    }

    /// Asks every plugin on the bus to stop
    pub async fn broadcast_terminate(&mut self) -> PluginResult<()> {
        info!(plugin = %self.identity.name, "Broadcasting PluginTerminate(*)");
        self.publish(PluginTerminate::wildcard()).await
    }

    async fn close(self) {
        self.publisher.close().await;
    }
}

/// Plugin behaviour plugged into a [`Dispatcher`]
#[async_trait]
pub trait EventHandler: Send {
    /// Producers exit on their first publish failure and announce
    /// `PluginTerminating` when they stop.
    fn is_producer(&self) -> bool {
        false
    }

    /// Runs once after `PluginStarted`, before the first receive
    async fn on_start(&mut self, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        Ok(Flow::Continue)
    }

    async fn handle(&mut self, event: Event, ctx: &mut PluginContext) -> PluginResult<Flow>;

    /// Runs after every receive timeout that did not end the loop
    async fn on_idle(&mut self, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        Ok(Flow::Continue)
    }

    /// True while the handler has output left to produce. The dispatcher
    /// then alternates between handling frames that already arrived and one
    /// `on_backlog` step, instead of waiting on the subscriber.
    fn has_backlog(&self) -> bool {
        false
    }

    async fn on_backlog(&mut self, _ctx: &mut PluginContext) -> PluginResult<Flow> {
        Ok(Flow::Continue)
    }

    /// Flushes pending work while draining
    async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

pub struct Dispatcher<H> {
    handler: H,
    ctx: PluginContext,
    subscriber: Socket,
    state: DispatcherState,
    idle_policy: IdlePolicy,
    poll_timeout: Duration,
    max_transport_errors: u32,
    announce_started: bool,
    transport_errors: u32,
}

impl<H: EventHandler> Dispatcher<H> {
    pub fn new(handler: H, ctx: PluginContext, subscriber: Socket, settings: &DispatcherConfig) -> Self {
        Self {
            handler,
            ctx,
            subscriber,
            state: DispatcherState::Starting,
            idle_policy: IdlePolicy::from_limit(settings.max_idle_timeouts),
            poll_timeout: settings.poll_timeout(),
            max_transport_errors: settings.max_transport_errors,
            announce_started: settings.announce_started,
            transport_errors: 0,
        }
    }

    pub fn with_idle_policy(mut self, policy: IdlePolicy) -> Self {
        self.idle_policy = policy;
        self
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    fn transition(&mut self, next: DispatcherState) {
        debug!(
            plugin = %self.ctx.identity.name,
            from = ?self.state,
            to = ?next,
            "Dispatcher state change"
        );
        self.state = next;
    }

    /// Runs the plugin to completion and returns the handler with the
    /// reason it stopped.
    pub async fn run(mut self) -> (H, ExitReason) {
        info!(
            plugin = %self.ctx.identity.name,
            plugin_uuid = %self.ctx.identity.uuid,
            producer = self.handler.is_producer(),
            "Plugin starting"
        );

        let mut early_exit = None;
        if self.announce_started {
            let started = PluginStarted::new(self.ctx.identity.name.clone(), self.ctx.identity.uuid);
            if let Err(e) = self.ctx.publish(started).await {
                early_exit = self.on_handler_error(e);
            }
        }

        self.transition(DispatcherState::Running);
        if early_exit.is_none() {
            early_exit = match self.handler.on_start(&mut self.ctx).await {
                Ok(Flow::Continue) => None,
                Ok(Flow::Complete) => Some(ExitReason::Completed),
                Err(e) => self.on_handler_error(e),
            };
        }

        let reason = match early_exit {
            Some(reason) => reason,
            None => self.event_loop().await,
        };

        self.transition(DispatcherState::Draining);
        if let Err(e) = self.handler.drain(&mut self.ctx).await {
            warn!(plugin = %self.ctx.identity.name, error = %e, "Drain failed");
        }
        if self.handler.is_producer() && !matches!(reason, ExitReason::TransportFailed(_)) {
            if let Err(e) = self.ctx.announce_terminating().await {
                warn!(plugin = %self.ctx.identity.name, error = %e, "Failed to announce termination");
            }
        }

        let name = self.ctx.identity.name.clone();
        let published = self.ctx.published();
        self.ctx.close().await;
        self.subscriber.close().await;
        self.state = DispatcherState::Stopped;

        info!(plugin = %name, reason = %reason, published, "Plugin stopped");
        (self.handler, reason)
    }

    async fn event_loop(&mut self) -> ExitReason {
        let mut idle_timeouts = 0u32;

        loop {
            if self.handler.has_backlog() {
                // Frames queued while producing are taken first so the
                // bounded receive queue never fills up.
                match self.subscriber.try_receive() {
                    Ok(Some(frame)) => {
                        idle_timeouts = 0;
                        self.transport_errors = 0;
                        if let Some(reason) = self.on_frame(frame).await {
                            return reason;
                        }
                    }
                    Ok(None) => {
                        idle_timeouts = 0;
                        let outcome = self.handler.on_backlog(&mut self.ctx).await;
                        if let Some(reason) = self.on_outcome(outcome) {
                            return reason;
                        }
                    }
                    Err(e) => {
                        if let Some(reason) = self.on_receive_error(e) {
                            return reason;
                        }
                    }
                }
                continue;
            }

            match self.subscriber.receive(self.poll_timeout).await {
                Ok(frame) => {
                    idle_timeouts = 0;
                    self.transport_errors = 0;
                    if let Some(reason) = self.on_frame(frame).await {
                        return reason;
                    }
                }
                Err(RecvError::Timeout) => {
                    idle_timeouts += 1;
                    if let IdlePolicy::ExitAfter(max) = self.idle_policy {
                        if idle_timeouts >= max {
                            warn!(
                                plugin = %self.ctx.identity.name,
                                timeouts = idle_timeouts,
                                "No events within the idle limit"
                            );
                            return ExitReason::IdleTimeout {
                                timeouts: idle_timeouts,
                            };
                        }
                    }

                    let outcome = self.handler.on_idle(&mut self.ctx).await;
                    if let Some(reason) = self.on_outcome(outcome) {
                        return reason;
                    }
                }
                Err(e) => {
                    if let Some(reason) = self.on_receive_error(e) {
                        return reason;
                    }
                }
            }
        }
    }

    /// Decodes and dispatches one frame
    async fn on_frame(&mut self, frame: Bytes) -> Option<ExitReason> {
        let event = match from_wire(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    plugin = %self.ctx.identity.name,
                    error = %e,
                    len = frame.len(),
                    "Dropping undecodable frame"
                );
                return None;
            }
        };

        if let Event::PluginTerminate(command) = &event {
            let identity = &self.ctx.identity;
            if is_addressed_to(command, &identity.name, &identity.uuid) {
                info!(
                    plugin = %identity.name,
                    target = %command.target_plugin_name,
                    "Received PluginTerminate"
                );
                return Some(ExitReason::Terminated);
            }
        }

        let outcome = self.handler.handle(event, &mut self.ctx).await;
        self.on_outcome(outcome)
    }

    fn on_receive_error(&mut self, e: RecvError) -> Option<ExitReason> {
        match e {
            RecvError::Timeout => None,
            RecvError::Transport(TransportError::Closed) => {
                error!(plugin = %self.ctx.identity.name, "Subscriber socket closed");
                Some(ExitReason::TransportFailed(TransportError::Closed.to_string()))
            }
            RecvError::Transport(e) => self.on_transport_error(e),
        }
    }

    fn on_outcome(&mut self, outcome: PluginResult<Flow>) -> Option<ExitReason> {
        match outcome {
            Ok(Flow::Continue) => None,
            Ok(Flow::Complete) => Some(ExitReason::Completed),
            Err(e) => self.on_handler_error(e),
        }
    }

    fn on_handler_error(&mut self, e: PluginError) -> Option<ExitReason> {
        match e {
            PluginError::Transport(transport) => {
                if self.handler.is_producer() {
                    error!(plugin = %self.ctx.identity.name, error = %transport, "Publish failed");
                    Some(ExitReason::TransportFailed(transport.to_string()))
                } else {
                    self.on_transport_error(transport)
                }
            }
            other => {
                warn!(plugin = %self.ctx.identity.name, error = %other, "Handler failed");
                None
            }
        }
    }

    fn on_transport_error(&mut self, e: TransportError) -> Option<ExitReason> {
        self.transport_errors += 1;
        warn!(
            plugin = %self.ctx.identity.name,
            error = %e,
            consecutive = self.transport_errors,
            limit = self.max_transport_errors,
            "Transport error"
        );
        if self.transport_errors > self.max_transport_errors {
            Some(ExitReason::TransportFailed(e.to_string()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camtrap_bus::{Broker, BrokerConfig, BusHandle};
    use camtrap_client::{ClientConfig, Role};
    use camtrap_events::ids::image_uuid;
    use camtrap_events::{EventKind, ImageReceived};
    use camtrap_filter::SubscriptionSet;

    /// Counts what it sees; completes after `complete_after` events
    #[derive(Default)]
    struct Recorder {
        seen: Vec<EventKind>,
        complete_after: Option<usize>,
        idle_calls: u32,
        drained: bool,
        producer: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn is_producer(&self) -> bool {
            self.producer
        }

        async fn handle(&mut self, event: Event, _ctx: &mut PluginContext) -> PluginResult<Flow> {
            self.seen.push(event.kind());
            match self.complete_after {
                Some(n) if self.seen.len() >= n => Ok(Flow::Complete),
                _ => Ok(Flow::Continue),
            }
        }

        async fn on_idle(&mut self, _ctx: &mut PluginContext) -> PluginResult<Flow> {
            self.idle_calls += 1;
            Ok(Flow::Continue)
        }

        async fn drain(&mut self, _ctx: &mut PluginContext) -> PluginResult<()> {
            self.drained = true;
            Ok(())
        }
    }

    fn client(addr: std::net::SocketAddr) -> ClientConfig {
        let mut config = ClientConfig::new(addr.to_string());
        config.reconnect.enabled = false;
        config
    }

    fn settings(max_idle: Option<u32>) -> DispatcherConfig {
        DispatcherConfig {
            poll_timeout_ms: 50,
            max_idle_timeouts: max_idle,
            max_transport_errors: 3,
            announce_started: true,
        }
    }

    async fn dispatcher(
        bus: &BusHandle,
        name: &str,
        kinds: &[EventKind],
        handler: Recorder,
        max_idle: Option<u32>,
    ) -> Dispatcher<Recorder> {
        let addr = bus.local_addrs()[0];
        let identity = PluginIdentity::new(name);
        let subscriber = Socket::connect(
            client(addr),
            &identity,
            Role::Subscriber,
            SubscriptionSet::from_kinds(kinds),
        )
        .await
        .unwrap();
        let publisher = Socket::connect(client(addr), &identity, Role::Publisher, SubscriptionSet::default())
            .await
            .unwrap();
        let ctx = PluginContext::new(identity, Arc::new(PipelineConfig::default()), publisher);
        Dispatcher::new(handler, ctx, subscriber, &settings(max_idle))
    }

    async fn external_publisher(bus: &BusHandle) -> Socket {
        Socket::connect(
            client(bus.local_addrs()[0]),
            &PluginIdentity::new("test_driver"),
            Role::Publisher,
            SubscriptionSet::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_idle_timeout_stops_silent_subscriber() {
        let bus = Broker::start(BrokerConfig::ephemeral()).await.unwrap();
        let dispatcher = dispatcher(
            &bus,
            "observer_plugin",
            &[EventKind::NewImage],
            Recorder::default(),
            Some(3),
        )
        .await;

        let (handler, reason) = tokio::time::timeout(Duration::from_secs(5), dispatcher.run())
            .await
            .expect("dispatcher hung");
        assert_eq!(reason, ExitReason::IdleTimeout { timeouts: 3 });
        assert_eq!(handler.idle_calls, 2);
        assert!(handler.drained);

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_activity_resets_idle_counter() {
        let bus = Broker::start(BrokerConfig::ephemeral()).await.unwrap();
        let dispatcher = dispatcher(
            &bus,
            "observer_plugin",
            &[EventKind::ImageReceived],
            Recorder::default(),
            Some(4),
        )
        .await;
        let driver = external_publisher(&bus).await;
        let run = tokio::spawn(dispatcher.run());

        // Each gap is shorter than the idle window (4 x 50ms).
        for i in 0..5 {
            let event: Event = ImageReceived::new(image_uuid(&format!("{i}.jpg")), "jpg").into();
            driver.publish(to_wire(&event)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        let (handler, reason) = run.await.unwrap();
        assert_eq!(reason, ExitReason::IdleTimeout { timeouts: 4 });
        assert_eq!(handler.seen, vec![EventKind::ImageReceived; 5]);

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_terminate_for_other_plugin_is_passed_through() {
        let bus = Broker::start(BrokerConfig::ephemeral()).await.unwrap();
        let dispatcher = dispatcher(
            &bus,
            "image_scoring_plugin",
            &[EventKind::PluginTerminate],
            Recorder::default(),
            None,
        )
        .await;
        let driver = external_publisher(&bus).await;
        let run = tokio::spawn(dispatcher.run());

        let other: Event = PluginTerminate::new("oracle_plugin", "").into();
        driver.publish(to_wire(&other)).await.unwrap();
        let mine: Event = PluginTerminate::new("image_scoring_plugin", "").into();
        driver.publish(to_wire(&mine)).await.unwrap();

        let (handler, reason) = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("dispatcher hung")
            .unwrap();
        assert_eq!(reason, ExitReason::Terminated);
        assert_eq!(handler.seen, vec![EventKind::PluginTerminate]);

        bus.shutdown();
    }

    #[tokio::test]
    async fn test_lifecycle_announcements_and_garbage_frames() {
        let bus = Broker::start(BrokerConfig::ephemeral()).await.unwrap();
        let addr = bus.local_addrs()[0];
        let mut watcher = Socket::connect(
            client(addr),
            &PluginIdentity::new("watcher"),
            Role::Subscriber,
            SubscriptionSet::from_kinds(&[EventKind::PluginStarted, EventKind::PluginTerminating]),
        )
        .await
        .unwrap();

        let handler = Recorder {
            producer: true,
            complete_after: Some(1),
            ..Default::default()
        };
        let dispatcher = dispatcher(&bus, "image_generating_plugin", &[EventKind::ImageStored], handler, None).await;
        let driver = external_publisher(&bus).await;
        let run = tokio::spawn(dispatcher.run());

        // A garbage body and a bare prefix, both under the subscribed tag.
        let mut bogus = camtrap_events::prefix::tag_for(EventKind::ImageStored).to_vec();
        bogus.extend_from_slice(b"not a flatbuffer");
        driver.publish(bogus).await.unwrap();
        driver.publish(vec![0x04, 0x00]).await.unwrap();
        let stored: Event =
            camtrap_events::ImageStored::new(image_uuid("a.jpg"), "jpg", "Save").into();
        driver.publish(to_wire(&stored)).await.unwrap();

        let (handler, reason) = run.await.unwrap();
        assert_eq!(reason, ExitReason::Completed);
        assert_eq!(handler.seen, vec![EventKind::ImageStored]);

        let wait = Duration::from_secs(2);
        let started = from_wire(&watcher.receive(wait).await.unwrap()).unwrap();
        let terminating = from_wire(&watcher.receive(wait).await.unwrap()).unwrap();
        assert_eq!(started.kind(), EventKind::PluginStarted);
        match terminating {
            Event::PluginTerminating(e) => assert_eq!(e.plugin_name, "image_generating_plugin"),
            other => panic!("unexpected {other:?}"),
        }

        bus.shutdown();
    }

    #[test]
    fn test_idle_policy_from_limit() {
        assert_eq!(IdlePolicy::from_limit(None), IdlePolicy::WaitForever);
        assert_eq!(IdlePolicy::from_limit(Some(0)), IdlePolicy::WaitForever);
        assert_eq!(IdlePolicy::from_limit(Some(5)), IdlePolicy::ExitAfter(5));
    }
}
