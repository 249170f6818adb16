//! Explicit wiring of every component a service owns.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{
        auth_providers::AuthProviderManager,
        client_manager::ClientManager,
        docs::DocsManager,
        http_server::HttpServer,
        memory_cache::{CacheComponent, MemoryCache},
        middleware::{StageDeps, register_configured},
        system_metrics::SystemMetricsCollector,
        system_routes,
        tls::TlsManager,
        websocket_broker::WebSocketBroker,
    },
    config::{models::ServiceConfig, provider::ConfigProvider},
    core::{
        actions::{EventDispatcher, HandlerTable},
        cron::CronScheduler,
        errors::{RuntimeError, RuntimeResult},
        health::{HealthManager, ServiceInfo},
        middleware::MiddlewareManager,
        router::Router,
    },
    metrics::MetricsManager,
    ports::{broker::ActionBroker, cache::CacheProvider, component::Component, http_client::OutboundClient},
    tracing_setup::LoggerComponent,
    utils::BuildInfo,
};

/// Every component of one service, built from its configuration.
///
/// Optional sections that are disabled in the configuration leave their
/// slot empty. Nothing here is started; the [`Service`](super::Service)
/// drives lifecycles in dependency order.
pub struct ServiceContext {
    pub config: Arc<ConfigProvider>,
    pub logger: Arc<LoggerComponent>,
    pub auth: Arc<AuthProviderManager>,
    pub health: Option<Arc<HealthManager>>,
    pub middlewares: Option<Arc<MiddlewareManager>>,
    pub docs: Option<Arc<DocsManager>>,
    pub metrics: Arc<MetricsManager>,
    pub system_metrics: Option<Arc<SystemMetricsCollector>>,
    pub cache: Option<Arc<CacheComponent>>,
    pub tls: Arc<TlsManager>,
    pub clients: Option<Arc<ClientManager>>,
    pub actions: Option<Arc<EventDispatcher>>,
    pub router: Arc<Router>,
    pub http: Arc<HttpServer>,
    pub cron: Option<Arc<CronScheduler>>,
}

impl ServiceContext {
    /// `root` parents component background tasks; `accept` stops the HTTP
    /// listener as soon as shutdown begins.
    pub fn build(
        provider: ConfigProvider,
        root: &CancellationToken,
        accept: &CancellationToken,
    ) -> RuntimeResult<Self> {
        let config: Arc<ServiceConfig> = provider.config();
        let logger = Arc::new(LoggerComponent::new(config.logger.clone()));
        let auth = Arc::new(AuthProviderManager::from_config(&config.auth_providers)?);

        let health = config.health.enabled.then(|| {
            Arc::new(HealthManager::new(ServiceInfo {
                name: config.name.clone(),
                version: config.version.clone(),
                host: config.server.http.host.clone(),
                port: config.server.http.port,
            }))
        });

        let cache = config.cache.enabled.then(|| {
            let store = Arc::new(MemoryCache::new(config.cache.clone()));
            Arc::new(CacheComponent::new(store, root.child_token()))
        });

        let middlewares = if config.middlewares.enabled {
            let manager = Arc::new(MiddlewareManager::new());
            register_configured(
                &manager,
                &config.middlewares,
                StageDeps {
                    service: config.name.clone(),
                    cache: cache.as_ref().map(|c| {
                        (
                            c.cache().clone() as Arc<dyn CacheProvider>,
                            config.cache.default_ttl,
                        )
                    }),
                    auth: Some(auth.clone()),
                    cancel: root.child_token(),
                },
            )?;
            Some(manager)
        } else {
            None
        };

        let router = Arc::new(Router::new(middlewares.clone()));
        system_routes::register_version_route(&router, &config.version, BuildInfo::discover())?;
        if let Some(health) = &health {
            system_routes::register_health_route(&router, health.clone())?;
        }

        let metrics = Arc::new(MetricsManager::new(config.metrics.clone()));
        if config.metrics.enabled {
            system_routes::register_metrics_route(&router, metrics.clone())?;
        }
        let system_metrics = (config.metrics.enabled && config.metrics.system).then(|| {
            Arc::new(SystemMetricsCollector::new(
                config.metrics.system_interval,
                root.child_token(),
            ))
        });

        let docs = if config.docs.enabled {
            let docs = Arc::new(DocsManager::new(
                config.docs.clone(),
                config.name.clone(),
                config.version.clone(),
                router.clone(),
            ));
            docs.register_routes(&router)?;
            Some(docs)
        } else {
            None
        };

        let tls = Arc::new(TlsManager::new(config.server.tls.clone()));

        let clients = if config.clients.enabled {
            Some(Arc::new(ClientManager::new(
                config.clients.clone(),
                Some(auth.as_ref()),
                root,
            )?))
        } else {
            None
        };

        let actions = if config.actions.enabled {
            let handlers = Arc::new(HandlerTable::new());
            let broker: Option<Arc<dyn ActionBroker>> = if config.actions.broker.enabled {
                match config.actions.broker.broker_type.as_str() {
                    "websocket" => Some(Arc::new(WebSocketBroker::new(
                        config.actions.broker.config.clone(),
                        handlers.clone(),
                        root.child_token(),
                    ))),
                    other => return Err(RuntimeError::ActionTypeUnknown(other.to_string())),
                }
            } else {
                None
            };
            let outbound = clients
                .clone()
                .filter(|_| config.actions.webhooks.enabled)
                .map(|c| c as Arc<dyn OutboundClient>);
            let dispatcher = Arc::new(EventDispatcher::new(
                config.actions.clone(),
                config.name.clone(),
                handlers,
                broker,
                outbound,
                root.child_token(),
            ));
            if config.actions.webhooks.enabled {
                dispatcher.register_routes(&router)?;
            }
            Some(dispatcher)
        } else {
            None
        };

        let http = Arc::new(HttpServer::new(
            config.server.http.clone(),
            router.clone(),
            Some(tls.clone()),
            accept.clone(),
        ));

        let cron = config
            .cron
            .enabled
            .then(|| Arc::new(CronScheduler::new(&config.cron, root.child_token())));

        Ok(Self {
            config: Arc::new(provider),
            logger,
            auth,
            health,
            middlewares,
            docs,
            metrics,
            system_metrics,
            cache,
            tls,
            clients,
            actions,
            router,
            http,
            cron,
        })
    }

    /// Serial init barrier: config, logger, auth, health, middleware manager.
    pub(crate) fn init_stage(&self) -> Vec<Arc<dyn Component>> {
        let mut stage: Vec<Arc<dyn Component>> = vec![
            self.config.clone() as Arc<dyn Component>,
            self.logger.clone(),
            self.auth.clone(),
        ];
        push(&mut stage, &self.health);
        push(&mut stage, &self.middlewares);
        stage
    }

    /// Independent components started in parallel.
    pub(crate) fn parallel_stage(&self) -> Vec<Arc<dyn Component>> {
        let mut stage: Vec<Arc<dyn Component>> = Vec::new();
        push(&mut stage, &self.docs);
        stage.push(self.metrics.clone());
        push(&mut stage, &self.system_metrics);
        push(&mut stage, &self.cache);
        stage.push(self.tls.clone());
        stage
    }

    /// Components that depend on the earlier stages, started in order.
    pub(crate) fn serving_stage(&self) -> Vec<Arc<dyn Component>> {
        let mut stage: Vec<Arc<dyn Component>> = Vec::new();
        push(&mut stage, &self.clients);
        push(&mut stage, &self.actions);
        stage.push(self.router.clone());
        stage.push(self.http.clone());
        push(&mut stage, &self.cron);
        stage
    }

    /// Producers and consumers that must quiesce first.
    pub(crate) fn quiesce_stage(&self) -> Vec<Arc<dyn Component>> {
        let mut stage: Vec<Arc<dyn Component>> = Vec::new();
        push(&mut stage, &self.cron);
        push(&mut stage, &self.system_metrics);
        push(&mut stage, &self.clients);
        push(&mut stage, &self.docs);
        push(&mut stage, &self.middlewares);
        push(&mut stage, &self.actions);
        stage
    }

    pub(crate) fn ingress_stage(&self) -> Vec<Arc<dyn Component>> {
        vec![
            self.auth.clone() as Arc<dyn Component>,
            self.router.clone(),
            self.http.clone(),
        ]
    }

    pub(crate) fn backing_stage(&self) -> Vec<Arc<dyn Component>> {
        let mut stage: Vec<Arc<dyn Component>> = vec![self.tls.clone() as Arc<dyn Component>];
        push(&mut stage, &self.cache);
        stage.push(self.metrics.clone());
        push(&mut stage, &self.health);
        stage
    }

    pub(crate) fn final_stage(&self) -> Vec<Arc<dyn Component>> {
        vec![self.config.clone() as Arc<dyn Component>, self.logger.clone()]
    }
}

fn push<C: Component>(stage: &mut Vec<Arc<dyn Component>>, slot: &Option<Arc<C>>) {
    if let Some(component) = slot {
        stage.push(component.clone());
    }
}
