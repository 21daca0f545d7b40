//! Topic transport over an in-process publish/subscribe broker.
//!
//! Topics are derived from the instance name:
//!
//! | topic                       | direction       | content                        |
//! |-----------------------------|-----------------|--------------------------------|
//! | `{instance}/api/request`    | client → relay  | JSON-RPC requests              |
//! | `{instance}/api/response`   | relay → client  | JSON-RPC responses             |
//! | `{instance}/notification`   | relay → client  | every notification but status  |
//! | `{instance}/status`         | relay → client  | `status_update` notifications  |
//!
//! The whole topic side is one hub connection.  Its static `status_objects`
//! are registered as interest at startup, so topic subscribers receive those
//! objects without ever calling `objects.subscribe`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::application::hub::{ClientSink, TopicBroker, TransportKind};
use crate::application::Broker;
use crate::domain::config::TopicConfig;
use crate::domain::messages::parse_request;

/// One published message.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Arc<String>,
}

/// In-process broker: every subscriber sees every message.
#[derive(Debug, Clone)]
pub struct LocalTopicBroker {
    tx: broadcast::Sender<TopicMessage>,
}

impl LocalTopicBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.tx.subscribe()
    }
}

impl TopicBroker for LocalTopicBroker {
    fn publish(&self, topic: &str, payload: Arc<String>) {
        // No subscribers is not an error for fire-and-forget delivery.
        let _ = self.tx.send(TopicMessage {
            topic: topic.to_string(),
            payload,
        });
    }
}

/// Topic names for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub request: String,
    pub response: String,
    pub notification: String,
    pub status: String,
}

impl TopicNames {
    pub fn new(instance: &str) -> Self {
        Self {
            request: format!("{instance}/api/request"),
            response: format!("{instance}/api/response"),
            notification: format!("{instance}/notification"),
            status: format!("{instance}/status"),
        }
    }
}

/// Serves the topic transport until `running` clears or the broker closes.
pub async fn run_topic_transport(
    broker: Arc<Broker>,
    topics: Arc<LocalTopicBroker>,
    config: TopicConfig,
    running: Arc<AtomicBool>,
) {
    let names = TopicNames::new(&config.instance_name);
    let mut rx = topics.subscribe();
    let sink = ClientSink::Topic {
        broker: topics.clone(),
        notification_topic: names.notification.clone(),
        status_topic: names.status.clone(),
    };
    let id = broker.connect(TransportKind::Topic, sink).await;
    info!(connection_id = id, request_topic = %names.request, "topic transport started");

    if let Err(e) = broker.register_static(id, &config.status_objects).await {
        warn!(error = %e, "static topic subscription deferred");
    }

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) if message.topic == names.request => {
                    let broker = Arc::clone(&broker);
                    let topics = Arc::clone(&topics);
                    let response_topic = names.response.clone();
                    tokio::spawn(async move {
                        let response = match parse_request(&message.payload) {
                            Ok(request) => broker.submit(id, request).await,
                            Err(error_response) => Some(error_response),
                        };
                        if let Some(response) = response {
                            topics.publish(&response_topic, Arc::new(response.to_json()));
                        }
                    });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "topic transport lagging; requests dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }

    broker.disconnect(id).await;
    debug!(connection_id = id, "topic transport stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_follow_instance() {
        let names = TopicNames::new("printer1");
        assert_eq!(names.request, "printer1/api/request");
        assert_eq!(names.response, "printer1/api/response");
        assert_eq!(names.notification, "printer1/notification");
        assert_eq!(names.status, "printer1/status");
    }

    #[tokio::test]
    async fn test_local_broker_fans_out_to_every_subscriber() {
        let broker = LocalTopicBroker::new(8);
        let mut a = broker.subscribe();
        let mut b = broker.subscribe();

        broker.publish("x/status", Arc::new("hello".into()));

        assert_eq!(a.recv().await.unwrap().payload.as_str(), "hello");
        assert_eq!(b.recv().await.unwrap().topic, "x/status");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let broker = LocalTopicBroker::new(1);
        broker.publish("x/notification", Arc::new("{}".into()));
    }
}
