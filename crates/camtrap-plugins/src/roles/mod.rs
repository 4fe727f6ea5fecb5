//! Plugin roles.
//!
//! Each role is an [`EventHandler`]; [`run_role`] connects it to the bus and
//! drives it with a [`Dispatcher`] until it exits.

pub mod ingest;
pub mod observe;
pub mod oracle;
pub mod power;
pub mod recv;
pub mod score;
pub mod store;

use camtrap_client::{ClientConfig, Role, Socket};
use camtrap_core::config::IngestMode;
use camtrap_core::{PipelineConfig, PluginIdentity, PluginRole};
use camtrap_filter::{resolve_subscriptions, SubscriptionSet};
use std::sync::Arc;
use tracing::info;

use crate::dispatcher::{Dispatcher, EventHandler, ExitReason, IdlePolicy, PluginContext};
use crate::error::PluginResult;

pub use ingest::IngestHandler;
pub use observe::ObserveHandler;
pub use oracle::OracleHandler;
pub use power::{PowerHandler, StaticSampler};
pub use recv::RecvHandler;
pub use score::{LabelMap, ScoreHandler};
pub use store::{StoreHandler, StorePolicy};

/// A role's bus connection: subscriber first, so its prefixes are
/// registered before the role publishes anything.
pub struct RoleConnection {
    pub identity: PluginIdentity,
    pub subscriber: Socket,
    pub publisher: Socket,
}

/// Connects `role` to `<bus.host>:<role port>`
pub async fn connect(role: PluginRole, config: &PipelineConfig) -> PluginResult<RoleConnection> {
    let identity = config.plugin_identity(role);
    let addr = format!("{}:{}", config.bus.host, config.plugin_port(role));
    let client = ClientConfig::from_transport(addr, &config.transport);
    let subscriptions = resolve_subscriptions(role, &config.plugin(role))?;

    let subscriber = Socket::connect(client.clone(), &identity, Role::Subscriber, subscriptions).await?;
    let publisher =
        Socket::connect(client, &identity, Role::Publisher, SubscriptionSet::default()).await?;

    Ok(RoleConnection {
        identity,
        subscriber,
        publisher,
    })
}

async fn run_handler<H>(role: PluginRole, config: Arc<PipelineConfig>, handler: H) -> PluginResult<ExitReason>
where
    H: EventHandler,
{
    let idle_policy = IdlePolicy::from_limit(config.dispatcher.max_idle_timeouts);
    run_handler_with(role, config, handler, idle_policy).await
}

async fn run_handler_with<H>(
    role: PluginRole,
    config: Arc<PipelineConfig>,
    handler: H,
    idle_policy: IdlePolicy,
) -> PluginResult<ExitReason>
where
    H: EventHandler,
{
    let RoleConnection {
        identity,
        subscriber,
        publisher,
    } = connect(role, &config).await?;
    info!(role = %role, plugin = %identity.name, plugin_uuid = %identity.uuid, "Plugin connected");

    let ctx = PluginContext::new(identity, Arc::clone(&config), publisher);
    let (_, reason) = Dispatcher::new(handler, ctx, subscriber, &config.dispatcher)
        .with_idle_policy(idle_policy)
        .run()
        .await;
    Ok(reason)
}

/// Builds the handler for `role`, connects it and runs it to completion
pub async fn run_role(role: PluginRole, config: Arc<PipelineConfig>) -> PluginResult<ExitReason> {
    match role {
        PluginRole::ImageGenerating => {
            let handler = IngestHandler::new(config.ingest.clone());
            match config.ingest.mode {
                // Quiet stretches between new files are expected.
                IngestMode::Watch => {
                    run_handler_with(role, config, handler, IdlePolicy::WaitForever).await
                }
                IngestMode::Batch => run_handler(role, config, handler).await,
            }
        }
        PluginRole::ImageReceiving => {
            let handler = RecvHandler::new(config.recv.clone());
            run_handler(role, config, handler).await
        }
        PluginRole::ImageScoring => {
            let scorer = score::scorer_from_config(&config.scoring)?;
            let handler = ScoreHandler::new(scorer, LabelMap::new(config.scoring.label_map.clone()))
                .with_power_monitoring(config.scoring.monitor_power);
            run_handler(role, config, handler).await
        }
        PluginRole::ImageStoring => {
            let handler = StoreHandler::new(StorePolicy::from_config(&config.store)?);
            run_handler(role, config, handler).await
        }
        PluginRole::Oracle => {
            let handler = OracleHandler::new(&config.oracle);
            run_handler(role, config, handler).await
        }
        PluginRole::PowerMeasuring => {
            let sampler = Arc::new(StaticSampler::new(config.power.static_watts.clone()));
            let handler = PowerHandler::new(config.power.clone(), sampler);
            run_handler(role, config, handler).await
        }
        PluginRole::Observer => run_handler(role, config, ObserveHandler::new()).await,
    }
}
