//! Event dispatcher: fan-out of published actions to the broker link and to
//! webhook subscribers, plus the inbound webhook routes.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    config::models::ActionsConfig,
    core::{
        actions::{
            message::{ActionHandler, ActionMessage, HandlerTable, MessageIdGenerator, run_handlers},
            webhooks::{CreateWebhookRequest, WebhookRegistry, WebhookSubscription, sign_payload},
        },
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
        router::{PathParams, RouteConfig, Router},
    },
    metrics,
    ports::{
        broker::ActionBroker,
        component::Component,
        http_client::{CallOptions, ClientResponse, OutboundClient},
    },
    utils::response::{bad_request, json_response, not_found},
};

/// Source recorded on messages reconstructed from webhook deliveries.
pub const WEBHOOK_SOURCE: &str = "webhook";

pub struct EventDispatcher {
    config: ActionsConfig,
    source: String,
    handlers: Arc<HandlerTable>,
    broker: Option<Arc<dyn ActionBroker>>,
    outbound: Option<Arc<dyn OutboundClient>>,
    registry: Arc<WebhookRegistry>,
    ids: MessageIdGenerator,
    inbound_ids: Arc<MessageIdGenerator>,
    root: CancellationToken,
    state: StateCell,
}

impl EventDispatcher {
    /// `source` names this service on published messages. `handlers` is the
    /// table shared with the broker link.
    pub fn new(
        config: ActionsConfig,
        source: impl Into<String>,
        handlers: Arc<HandlerTable>,
        broker: Option<Arc<dyn ActionBroker>>,
        outbound: Option<Arc<dyn OutboundClient>>,
        root: CancellationToken,
    ) -> Self {
        let source = source.into();
        Self {
            config,
            ids: MessageIdGenerator::new(source.clone()),
            inbound_ids: Arc::new(MessageIdGenerator::new(WEBHOOK_SOURCE)),
            source,
            handlers,
            broker,
            outbound,
            registry: Arc::new(WebhookRegistry::new()),
            root,
            state: StateCell::new(),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    /// Register a local handler. Only allowed before start.
    pub fn subscribe(&self, action: &str, handler: ActionHandler) -> RuntimeResult<()> {
        let start = Instant::now();
        let result = if action.trim().is_empty() {
            Err(RuntimeError::ActionConfigInvalid(
                "action name is empty".to_string(),
            ))
        } else if self.state.is_running() {
            Err(RuntimeError::ActionIsRunning)
        } else {
            let total = self.handlers.add(action, handler);
            tracing::debug!(action, total_handlers = total, "Subscribed to action");
            Ok(())
        };
        metrics::record_action_operation("subscribe", outcome(&result), action, start.elapsed());
        result
    }

    /// Drop every local handler of `action`. Only allowed while running.
    pub fn unsubscribe(&self, action: &str) -> RuntimeResult<()> {
        let start = Instant::now();
        let result = if self.state.is_running() {
            let removed = self.handlers.remove(action);
            tracing::debug!(action, removed_handlers = removed, "Unsubscribed from action");
            Ok(())
        } else {
            Err(RuntimeError::NotInitialized)
        };
        metrics::record_action_operation("unsubscribe", outcome(&result), action, start.elapsed());
        result
    }

    /// Publish `payload` under `action` to every configured channel.
    ///
    /// Succeeds when at least one channel acknowledged; partial failures are
    /// logged. Fails with `NoPublicationChannels` when nothing is configured.
    pub async fn publish(&self, action: &str, payload: Value) -> RuntimeResult<()> {
        let start = Instant::now();
        let result = self.publish_inner(action, payload).await;
        let label = match &result {
            Ok(PublishOutcome::Complete) => "success",
            Ok(PublishOutcome::Partial) => "partial_success",
            Err(_) => "error",
        };
        metrics::record_action_operation("publish", label, action, start.elapsed());
        result.map(|_| ())
    }

    async fn publish_inner(&self, action: &str, payload: Value) -> RuntimeResult<PublishOutcome> {
        if !self.state.is_running() {
            return Err(RuntimeError::NotInitialized);
        }
        let broker = self.broker.as_ref().filter(|_| self.config.broker.enabled);
        let webhooks_enabled = self.config.webhooks.enabled;
        if broker.is_none() && !webhooks_enabled {
            return Err(RuntimeError::NoPublicationChannels(action.to_string()));
        }

        let message = ActionMessage::new(action, payload, self.source.clone(), self.ids.next_id());
        tracing::debug!(action, message_id = %message.message_id, "Publishing event");

        let broker_channel = async {
            match broker {
                Some(broker) => Some(broker.publish(message.clone())),
                None => None,
            }
        };
        let webhook_channel = async {
            if webhooks_enabled {
                Some(self.notify_webhooks(&message).await)
            } else {
                None
            }
        };

        let deadline = self.config.webhooks.timeout;
        let (broker_result, webhook_result) = tokio::time::timeout(
            deadline,
            futures_util::future::join(broker_channel, webhook_channel),
        )
        .await
        .map_err(|_| {
            RuntimeError::TimedOut(format!("publish '{action}' exceeded {deadline:?}"))
        })?;

        let mut succeeded = 0;
        let mut errors = Vec::new();
        for (channel, result) in [("broker", broker_result), ("webhooks", webhook_result)] {
            match result {
                Some(Ok(())) => succeeded += 1,
                Some(Err(e)) => {
                    tracing::error!(action, channel, "Publish channel failed: {}", e);
                    errors.push(e);
                }
                None => {}
            }
        }

        match (succeeded, errors.len()) {
            (_, 0) => Ok(PublishOutcome::Complete),
            (s, failed) if s > 0 => {
                tracing::warn!(action, failed_count = failed, "Some publishers failed");
                Ok(PublishOutcome::Partial)
            }
            (_, 1) => Err(errors.remove(0)),
            _ => Err(RuntimeError::PublishFailed(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }

    /// Deliver to configured peer services and runtime subscriptions in parallel.
    async fn notify_webhooks(&self, message: &ActionMessage) -> RuntimeResult<()> {
        let peers = self
            .outbound
            .as_ref()
            .map(|client| client.subscribers(&message.action))
            .unwrap_or_default();
        let subscriptions = self.registry.for_event(&message.action).await;
        if peers.is_empty() && subscriptions.is_empty() {
            tracing::debug!(action = %message.action, "No webhook subscribers for action");
            return Ok(());
        }
        let Some(outbound) = self.outbound.clone() else {
            return Err(RuntimeError::PublishFailed(
                "webhook subscribers exist but no outbound client is configured".to_string(),
            ));
        };

        let body = serde_json::to_value(message)
            .map_err(|e| RuntimeError::wrap("failed to encode action message", e))?;
        let raw = Bytes::from(body.to_string());
        let path = format!("/webhook/{}", message.action);

        let peer_deliveries = peers.iter().map(|service| {
            let outbound = outbound.clone();
            let body = body.clone();
            let path = path.clone();
            async move {
                outbound
                    .call_service(service, Method::POST, &path, Some(body), CallOptions::default())
                    .await
                    .and_then(ClientResponse::error_for_status)
                    .map(|_| ())
                    .map_err(|e| format!("service '{service}': {e}"))
            }
        });
        let subscription_deliveries = subscriptions.iter().map(|subscription| {
            let outbound = outbound.clone();
            let raw = raw.clone();
            async move {
                let headers = self.delivery_headers(subscription, &raw);
                outbound
                    .post_absolute(&subscription.url, raw, headers, self.config.webhooks.timeout)
                    .await
                    .and_then(ClientResponse::error_for_status)
                    .map(|_| ())
                    .map_err(|e| format!("subscription '{}': {e}", subscription.id))
            }
        });

        let (peer_results, subscription_results) = futures_util::future::join(
            futures_util::future::join_all(peer_deliveries),
            futures_util::future::join_all(subscription_deliveries),
        )
        .await;

        let total = peer_results.len() + subscription_results.len();
        let failures: Vec<String> = peer_results
            .into_iter()
            .chain(subscription_results)
            .filter_map(Result::err)
            .collect();
        for failure in &failures {
            tracing::error!(action = %message.action, "Webhook delivery failed: {}", failure);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::PublishFailed(format!(
                "{} of {} webhook deliveries failed: {}",
                failures.len(),
                total,
                failures.join("; ")
            )))
        }
    }

    fn delivery_headers(&self, subscription: &WebhookSubscription, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(&self.config.webhooks.user_agent) {
            headers.insert(header::USER_AGENT, agent);
        }
        for (name, value) in &subscription.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(
                    id = %subscription.id,
                    header = %name,
                    "Skipping invalid webhook header"
                ),
            }
        }
        if !subscription.secret.is_empty() {
            let signature = format!("sha256={}", sign_payload(&subscription.secret, body));
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert(HeaderName::from_static("x-signature"), value);
            }
        }
        headers
    }

    /// Mount the webhook ingress and administration routes.
    pub fn register_routes(self: &Arc<Self>, router: &Router) -> RuntimeResult<()> {
        let config = RouteConfig::default()
            .with_timeout(Duration::from_secs(5))
            .without_middlewares(["cache"]);

        let registry = self.registry.clone();
        router.add(
            Method::POST,
            "/webhook/create",
            move |body: Bytes| {
                let registry = registry.clone();
                async move { create_subscription(&registry, &body).await }
            },
            config.clone(),
        )?;

        let registry = self.registry.clone();
        router.add(
            Method::GET,
            "/webhook/list",
            move || {
                let registry = registry.clone();
                async move {
                    let webhooks = registry.list().await;
                    json_response(
                        StatusCode::OK,
                        json!({ "total": webhooks.len(), "webhooks": webhooks }),
                    )
                }
            },
            config.clone(),
        )?;

        let registry = self.registry.clone();
        router.add(
            Method::DELETE,
            "/webhook/remove/{id}",
            move |params: PathParams| {
                let registry = registry.clone();
                async move {
                    let id = params.get("id").unwrap_or_default().to_string();
                    if registry.remove(&id).await {
                        json_response(StatusCode::OK, json!({ "status": "deleted", "id": id }))
                    } else {
                        not_found("Webhook not found")
                    }
                }
            },
            config.clone(),
        )?;

        let ingress = Inbound {
            handlers: self.handlers.clone(),
            ids: self.inbound_ids.clone(),
            timeout: self.config.webhooks.handler_timeout,
            root: self.root.clone(),
        };
        router.add(
            Method::POST,
            "/webhook/{action}",
            move |params: PathParams, body: Bytes| {
                let ingress = ingress.clone();
                async move { ingress.receive(params.get("action").unwrap_or_default(), &body) }
            },
            config,
        )?;
        Ok(())
    }
}

enum PublishOutcome {
    Complete,
    Partial,
}

fn outcome<T>(result: &RuntimeResult<T>) -> &'static str {
    if result.is_ok() { "success" } else { "error" }
}

async fn create_subscription(registry: &WebhookRegistry, body: &[u8]) -> Response {
    let request: CreateWebhookRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("Invalid JSON payload: {e}")),
    };
    match registry.create(request).await {
        Ok(subscription) => json_response(
            StatusCode::CREATED,
            serde_json::to_value(&subscription).unwrap_or(Value::Null),
        ),
        Err(e) => bad_request(e.to_string()),
    }
}

#[derive(Clone)]
struct Inbound {
    handlers: Arc<HandlerTable>,
    ids: Arc<MessageIdGenerator>,
    timeout: Duration,
    root: CancellationToken,
}

impl Inbound {
    fn receive(&self, action: &str, body: &[u8]) -> Response {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => return bad_request(format!("Invalid JSON payload: {e}")),
        };
        if !self.handlers.has_handlers(action) {
            return not_found("No handler for action");
        }

        let message = match serde_json::from_value::<ActionMessage>(value.clone()) {
            Ok(envelope) => ActionMessage {
                action: action.to_string(),
                source: WEBHOOK_SOURCE.to_string(),
                message_id: if envelope.message_id.is_empty() {
                    self.ids.next_id()
                } else {
                    envelope.message_id
                },
                ..envelope
            },
            Err(_) => ActionMessage::new(action, value, WEBHOOK_SOURCE, self.ids.next_id()),
        };

        tracing::debug!(action, message_id = %message.message_id, "Webhook received");
        let handlers = self.handlers.clone();
        let timeout = self.timeout;
        let root = self.root.clone();
        tokio::spawn(async move {
            run_handlers(&handlers, message, timeout, &root).await;
        });

        json_response(StatusCode::OK, json!({ "status": "accepted" }))
    }
}

#[async_trait]
impl Component for EventDispatcher {
    fn name(&self) -> &'static str {
        "actions"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }
        if let Some(broker) = self.broker.as_ref().filter(|_| self.config.broker.enabled) {
            match broker.start().await {
                Ok(()) => tracing::info!(broker = broker.broker_type(), "Action broker started"),
                Err(e) => tracing::error!(
                    broker = broker.broker_type(),
                    "Failed to start action broker: {}",
                    e
                ),
            }
        }
        self.state.set(LifecycleState::Running);
        tracing::info!(
            actions = ?self.handlers.actions(),
            webhooks = self.config.webhooks.enabled,
            "Event dispatcher started"
        );
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return Err(RuntimeError::NotRunning);
        }
        if let Some(broker) = &self.broker
            && broker.is_running()
            && let Err(e) = broker.stop().await
        {
            tracing::error!("Failed to stop action broker: {}", e);
        }
        self.state.set(LifecycleState::Stopped);
        tracing::info!("Event dispatcher stopped");
        Ok(())
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        config::models::{BrokerConfig, WebhooksConfig},
        core::actions::message::handler,
        ports::http_client::ClientResponse,
    };

    /// Broker double recording what would go on the wire.
    struct QueueBroker {
        capacity: usize,
        queue: Mutex<Vec<ActionMessage>>,
        state: StateCell,
    }

    impl QueueBroker {
        fn new(capacity: usize) -> Arc<Self> {
            Arc::new(Self {
                capacity,
                queue: Mutex::new(Vec::new()),
                state: StateCell::new(),
            })
        }
    }

    #[async_trait]
    impl Component for QueueBroker {
        fn name(&self) -> &'static str {
            "queue-broker"
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

    impl ActionBroker for QueueBroker {
        fn broker_type(&self) -> &'static str {
            "queue"
        }

        fn publish(&self, message: ActionMessage) -> RuntimeResult<()> {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                return Err(RuntimeError::PublishFailed("queue full".to_string()));
            }
            queue.push(message);
            Ok(())
        }

        fn queued(&self) -> usize {
            self.queue.lock().unwrap().len()
        }
    }

    /// Outbound double with one peer subscribed to `created`.
    #[derive(Default)]
    struct RecordingOutbound {
        calls: Mutex<Vec<(String, String, Value)>>,
        posts: Mutex<Vec<(String, HeaderMap, Bytes)>>,
        fail_peers: bool,
    }

    #[async_trait]
    impl OutboundClient for RecordingOutbound {
        fn subscribers(&self, action: &str) -> Vec<String> {
            if action == "created" {
                vec!["billing".to_string()]
            } else {
                Vec::new()
            }
        }

        async fn call_service(
            &self,
            service: &str,
            _method: Method,
            path: &str,
            body: Option<Value>,
            _options: CallOptions,
        ) -> RuntimeResult<ClientResponse> {
            if self.fail_peers {
                return Err(RuntimeError::request_failed("peer down"));
            }
            self.calls.lock().unwrap().push((
                service.to_string(),
                path.to_string(),
                body.unwrap_or(Value::Null),
            ));
            Ok(ClientResponse {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        }

        async fn post_absolute(
            &self,
            url: &str,
            body: Bytes,
            headers: HeaderMap,
            _timeout: Duration,
        ) -> RuntimeResult<ClientResponse> {
            self.posts
                .lock()
                .unwrap()
                .push((url.to_string(), headers, body));
            Ok(ClientResponse {
                status: StatusCode::NO_CONTENT,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        }
    }

    fn actions_config(broker: bool, webhooks: bool) -> ActionsConfig {
        ActionsConfig {
            enabled: true,
            broker: BrokerConfig {
                enabled: broker,
                ..Default::default()
            },
            webhooks: WebhooksConfig {
                enabled: webhooks,
                ..Default::default()
            },
        }
    }

    fn dispatcher(
        config: ActionsConfig,
        broker: Option<Arc<QueueBroker>>,
        outbound: Option<Arc<RecordingOutbound>>,
    ) -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(
            config,
            "orders",
            Arc::new(HandlerTable::new()),
            broker.map(|b| b as Arc<dyn ActionBroker>),
            outbound.map(|o| o as Arc<dyn OutboundClient>),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_broker_and_peer() {
        let broker = QueueBroker::new(8);
        let outbound = Arc::new(RecordingOutbound::default());
        let dispatcher = dispatcher(
            actions_config(true, true),
            Some(broker.clone()),
            Some(outbound.clone()),
        );
        dispatcher.start().await.unwrap();

        dispatcher.publish("created", json!({"id": 7})).await.unwrap();

        let queued = broker.queue.lock().unwrap().clone();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, "created");
        assert_eq!(queued[0].payload, json!({"id": 7}));
        assert_eq!(queued[0].source, "orders");

        let calls = outbound.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "billing");
        assert_eq!(calls[0].1, "/webhook/created");
        let delivered: ActionMessage = serde_json::from_value(calls[0].2.clone()).unwrap();
        assert_eq!(delivered, queued[0]);
    }

    #[tokio::test]
    async fn test_publish_requires_running_and_channels() {
        let dispatcher_without_channels = dispatcher(actions_config(false, false), None, None);
        assert!(matches!(
            dispatcher_without_channels.publish("created", json!({})).await,
            Err(RuntimeError::NotInitialized)
        ));
        dispatcher_without_channels.start().await.unwrap();
        assert!(matches!(
            dispatcher_without_channels.publish("created", json!({})).await,
            Err(RuntimeError::NoPublicationChannels(_))
        ));
    }

    #[tokio::test]
    async fn test_full_broker_queue_with_only_broker_fails() {
        let broker = QueueBroker::new(1);
        let dispatcher = dispatcher(actions_config(true, false), Some(broker.clone()), None);
        dispatcher.start().await.unwrap();

        dispatcher.publish("created", json!({"n": 1})).await.unwrap();
        assert!(matches!(
            dispatcher.publish("created", json!({"n": 2})).await,
            Err(RuntimeError::PublishFailed(_))
        ));
        assert_eq!(broker.queued(), 1);
    }

    #[tokio::test]
    async fn test_partial_success_is_ok() {
        let broker = QueueBroker::new(8);
        let outbound = Arc::new(RecordingOutbound {
            fail_peers: true,
            ..Default::default()
        });
        let dispatcher = dispatcher(actions_config(true, true), Some(broker.clone()), Some(outbound));
        dispatcher.start().await.unwrap();
        dispatcher.publish("created", json!({"id": 1})).await.unwrap();
        assert_eq!(broker.queued(), 1);
    }

    #[tokio::test]
    async fn test_subscription_rules() {
        let dispatcher = dispatcher(actions_config(true, false), Some(QueueBroker::new(1)), None);
        assert!(matches!(
            dispatcher.subscribe("", handler(|_| async { Ok(()) })),
            Err(RuntimeError::ActionConfigInvalid(_))
        ));
        assert!(matches!(
            dispatcher.unsubscribe("created"),
            Err(RuntimeError::NotInitialized)
        ));
        dispatcher
            .subscribe("created", handler(|_| async { Ok(()) }))
            .unwrap();
        dispatcher.start().await.unwrap();
        assert!(matches!(
            dispatcher.subscribe("created", handler(|_| async { Ok(()) })),
            Err(RuntimeError::ActionIsRunning)
        ));
        dispatcher.unsubscribe("created").unwrap();
        assert!(!dispatcher.handlers().has_handlers("created"));
    }

    #[tokio::test]
    async fn test_registered_subscriptions_are_signed() {
        let outbound = Arc::new(RecordingOutbound::default());
        let dispatcher = dispatcher(actions_config(false, true), None, Some(outbound.clone()));
        let subscription = dispatcher
            .registry()
            .create(CreateWebhookRequest {
                event: "shipped".to_string(),
                url: "http://127.0.0.1:9/hook".to_string(),
                headers: Some([("X-Tenant".to_string(), "acme".to_string())].into()),
                enabled: None,
                secret: Some("s3cret".to_string()),
            })
            .await
            .unwrap();
        dispatcher.start().await.unwrap();
        dispatcher.publish("shipped", json!({"id": 3})).await.unwrap();

        let posts = outbound.posts.lock().unwrap().clone();
        assert_eq!(posts.len(), 1);
        let (url, headers, body) = &posts[0];
        assert_eq!(url, &subscription.url);
        assert_eq!(headers["x-tenant"], "acme");
        let expected = format!("sha256={}", sign_payload("s3cret", body));
        assert_eq!(headers["x-signature"], expected.as_str());
    }

    #[tokio::test]
    async fn test_inbound_webhook_route() {
        let dispatcher = dispatcher(actions_config(false, true), None, None);
        let received = Arc::new(Mutex::new(Vec::<ActionMessage>::new()));
        let sink = received.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .subscribe(
                "created",
                handler(move |message| {
                    let sink = sink.clone();
                    let counter = counter.clone();
                    async move {
                        sink.lock().unwrap().push(message);
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        dispatcher.start().await.unwrap();

        let router = Arc::new(Router::new(None));
        dispatcher.register_routes(&router).unwrap();
        let app = router.into_axum();

        let published = ActionMessage::new("created", json!({"id": 7}), "billing", "billing-1-1".into());
        let response = app
            .clone()
            .oneshot(
                axum::extract::Request::builder()
                    .method(Method::POST)
                    .uri("/webhook/created")
                    .body(Body::from(serde_json::to_vec(&published).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"status":"accepted"}"#);

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].action, published.action);
        assert_eq!(received[0].payload, published.payload);
        assert_eq!(received[0].source, WEBHOOK_SOURCE);

        let response = app
            .oneshot(
                axum::extract::Request::builder()
                    .method(Method::POST)
                    .uri("/webhook/deleted")
                    .body(Body::from(r#"{"id":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["message"], "No handler for action");
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let dispatcher = dispatcher(actions_config(false, true), None, None);
        let router = Arc::new(Router::new(None));
        dispatcher.register_routes(&router).unwrap();
        let app = router.into_axum();

        let response = app
            .clone()
            .oneshot(
                axum::extract::Request::builder()
                    .method(Method::POST)
                    .uri("/webhook/create")
                    .body(Body::from(r#"{"event":"created","url":"http://127.0.0.1:9/in"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: WebhookSubscription = serde_json::from_slice(&body).unwrap();
        assert!(!created.secret.is_empty());

        let response = app
            .clone()
            .oneshot(
                axum::extract::Request::builder()
                    .uri("/webhook/list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let listed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(listed["total"], 1);

        let response = app
            .oneshot(
                axum::extract::Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/webhook/remove/{}", created.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(dispatcher.registry().is_empty());
    }
}
