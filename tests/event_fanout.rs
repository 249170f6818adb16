mod common;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use common::ScriptedPeer;
use keel::{
    Component, LifecycleState, RuntimeError, RuntimeResult,
    adapters::ClientManager,
    config::{ActionsConfig, BrokerConfig, ClientsConfig, ServiceClientConfig, WebhooksConfig},
    core::{
        actions::{ActionMessage, EventDispatcher, HandlerTable},
        lifecycle::StateCell,
    },
    ports::{broker::ActionBroker, http_client::OutboundClient},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Broker link that keeps what it would have written.
#[derive(Default)]
struct RecordingBroker {
    queue: Mutex<Vec<ActionMessage>>,
    state: StateCell,
}

#[async_trait]
impl Component for RecordingBroker {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn start(&self) -> RuntimeResult<()> {
        self.state.set(LifecycleState::Running);
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        self.state.set(LifecycleState::Stopped);
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

impl ActionBroker for RecordingBroker {
    fn broker_type(&self) -> &'static str {
        "recording"
    }

    fn publish(&self, message: ActionMessage) -> RuntimeResult<()> {
        if !self.is_running() {
            return Err(RuntimeError::NotRunning);
        }
        self.queue.lock().unwrap().push(message);
        Ok(())
    }

    fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[tokio::test]
async fn test_publish_fans_out_to_broker_and_webhook_peer() {
    let peer = ScriptedPeer::start(vec![]).await;
    let cancel = CancellationToken::new();
    let clients = Arc::new(
        ClientManager::new(
            ClientsConfig {
                enabled: true,
                services: HashMap::from([(
                    "audit".to_string(),
                    ServiceClientConfig {
                        url: peer.url(),
                        events: vec!["created".to_string()],
                        ..Default::default()
                    },
                )]),
                ..Default::default()
            },
            None,
            &cancel,
        )
        .unwrap(),
    );
    clients.start().await.unwrap();

    let broker = Arc::new(RecordingBroker::default());
    let dispatcher = EventDispatcher::new(
        ActionsConfig {
            enabled: true,
            broker: BrokerConfig {
                enabled: true,
                ..Default::default()
            },
            webhooks: WebhooksConfig {
                enabled: true,
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        },
        "orders",
        Arc::new(HandlerTable::new()),
        Some(broker.clone() as Arc<dyn ActionBroker>),
        Some(clients.clone() as Arc<dyn OutboundClient>),
        cancel.clone(),
    );
    dispatcher.start().await.unwrap();
    assert!(broker.is_running());

    dispatcher.publish("created", json!({ "id": 7 })).await.unwrap();

    let queued = broker.queue.lock().unwrap().clone();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, "created");
    assert_eq!(queued[0].payload, json!({ "id": 7 }));
    assert_eq!(queued[0].source, "orders");

    let deliveries = peer.bodies.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 1);
    let (path, body) = &deliveries[0];
    assert_eq!(path, "/webhook/created");
    let delivered: ActionMessage = serde_json::from_slice(body).unwrap();
    assert_eq!(delivered, queued[0]);

    dispatcher.stop().await.unwrap();
    assert!(!broker.is_running());
    clients.stop().await.unwrap();
}
