//! Wires the components together and runs them until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use crate::application::{
    Broker, ConfigAuthorizer, JobScheduler, MemoryQueueStore, QueueStore, SubscriptionService,
    TransportHub,
};
use crate::domain::BridgeConfig;
use crate::infrastructure::http_server::run_http_server;
use crate::infrastructure::link::Link;
use crate::infrastructure::store::TomlQueueStore;
use crate::infrastructure::topic::{run_topic_transport, LocalTopicBroker};
use crate::infrastructure::ws_server::run_ws_server;

/// Capacity of the in-process topic broker ring.
const TOPIC_CAPACITY: usize = 1024;

/// Builds the broker from `config` and serves every enabled transport until
/// `running` clears.
///
/// # Errors
///
/// Returns an error if a listen address is invalid or a listener fails; the
/// other tasks are stopped first.
pub async fn run_relay(config: BridgeConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let ws_addr = config.server.ws_addr().context("invalid WebSocket address")?;
    let http_addr = config.server.http_addr().context("invalid HTTP address")?;

    let (link, events) = Link::new(config.upstream.call_timeout());
    let channel = Arc::new(link.clone());
    let hub = Arc::new(TransportHub::new(Arc::new(ConfigAuthorizer::new(
        &config.authorization,
    ))));
    let store: Arc<dyn QueueStore> = match &config.job_queue.queue_file {
        Some(path) => Arc::new(TomlQueueStore::new(path)),
        None => Arc::new(MemoryQueueStore::new()),
    };
    let subscriptions = Arc::new(SubscriptionService::new(channel.clone()));
    let scheduler = Arc::new(JobScheduler::new(
        channel,
        Arc::clone(&hub),
        store,
        config.job_queue.clone(),
    ));
    let broker = Arc::new(Broker::new(hub, subscriptions, scheduler));
    broker.init().await;

    #[cfg(unix)]
    let link_task = tokio::spawn(link.run(
        config.upstream.socket_path.clone(),
        config.upstream.reconnect_interval(),
        Arc::clone(&running),
    ));
    #[cfg(not(unix))]
    let link_task = {
        error!("Unix-domain control sockets are not supported on this platform");
        drop(link);
        tokio::spawn(async {})
    };

    let event_task = {
        let broker = Arc::clone(&broker);
        let running = Arc::clone(&running);
        let resync = config.upstream.resync_interval();
        tokio::spawn(async move { broker.run_events(events, running, resync).await })
    };

    let topic_task = config.topic.enabled.then(|| {
        let topics = Arc::new(LocalTopicBroker::new(TOPIC_CAPACITY));
        tokio::spawn(run_topic_transport(
            Arc::clone(&broker),
            topics,
            config.topic.clone(),
            Arc::clone(&running),
        ))
    });

    let ws = stop_on_error(
        run_ws_server(
            ws_addr,
            Arc::clone(&broker),
            config.server.max_send_queue,
            Arc::clone(&running),
        ),
        Arc::clone(&running),
    );
    let http = stop_on_error(
        run_http_server(http_addr, Arc::clone(&broker), Arc::clone(&running)),
        Arc::clone(&running),
    );
    let (ws_result, http_result) = tokio::join!(ws, http);
    running.store(false, Ordering::Relaxed);

    let _ = link_task.await;
    let _ = event_task.await;
    if let Some(task) = topic_task {
        let _ = task.await;
    }
    info!(connections = broker.hub().connection_count().await, "relay stopped");
    ws_result.and(http_result)
}

/// Clears `running` when `task` fails, so one failed listener stops the rest.
async fn stop_on_error(
    task: impl std::future::Future<Output = anyhow::Result<()>>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let result = task.await;
    if let Err(e) = &result {
        error!("{e:#}");
        running.store(false, Ordering::Relaxed);
    }
    result
}
