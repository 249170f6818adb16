//! HTTP listener: plain TCP, manual TLS or ACME, all serving the router.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::Request,
    middleware::{self as axum_middleware, Next as AxumNext},
    serve::{Listener, ListenerExt},
};
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::{
    compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
    sync::CancellationToken,
};

use crate::{
    adapters::tls::{AcmeSettings, TlsManager, TlsMode},
    config::models::HttpConfig,
    core::{
        errors::{RuntimeError, RuntimeResult},
        lifecycle::{LifecycleState, StateCell},
        router::Router,
    },
    ports::component::Component,
    utils::response::service_unavailable,
};

/// Adapts a stream of accepted connections to [`axum::serve`].
struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

type ServeTask = JoinHandle<std::io::Result<()>>;

pub struct HttpServer {
    config: HttpConfig,
    router: Arc<Router>,
    tls: Option<Arc<TlsManager>>,
    parent: CancellationToken,
    shutdown: Mutex<Option<CancellationToken>>,
    task: tokio::sync::Mutex<Option<ServeTask>>,
    local_addr: Mutex<Option<SocketAddr>>,
    state: StateCell,
}

impl HttpServer {
    pub fn new(
        config: HttpConfig,
        router: Arc<Router>,
        tls: Option<Arc<TlsManager>>,
        parent: CancellationToken,
    ) -> Self {
        Self {
            config,
            router,
            tls,
            parent,
            shutdown: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            state: StateCell::new(),
        }
    }

    /// Bound address, available once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn app(&self) -> axum::Router {
        let app = self.router.into_axum();
        let limit = self.config.write_timeout;
        if limit.is_zero() {
            return app;
        }
        app.layer(axum_middleware::from_fn(
            move |req: Request, next: AxumNext| async move {
                match tokio::time::timeout(limit, next.run(req)).await {
                    Ok(response) => response,
                    Err(_) => service_unavailable("Request exceeded the server write timeout"),
                }
            },
        ))
    }

    fn tls_mode(&self) -> RuntimeResult<Option<TlsMode>> {
        match &self.tls {
            Some(tls) if tls.enabled() => tls.mode().map(Some).ok_or_else(|| {
                RuntimeError::ConfigInvalid("TLS is enabled but not initialized".to_string())
            }),
            _ => Ok(None),
        }
    }

    async fn bind(&self) -> RuntimeResult<(TcpListener, SocketAddr)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RuntimeError::wrap(format!("failed to bind {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RuntimeError::wrap("failed to read local address", e))?;
        Ok((listener, local_addr))
    }

    async fn spawn_server(&self, shutdown: CancellationToken) -> RuntimeResult<(ServeTask, SocketAddr)> {
        let tls = self.tls_mode()?;
        let (listener, local_addr) = self.bind().await?;
        let app = self.app();

        let task = match tls {
            None => {
                let listener = listener.tap_io(|tcp| {
                    if let Err(e) = tcp.set_nodelay(true) {
                        tracing::trace!("Failed to set TCP_NODELAY: {}", e);
                    }
                });
                tokio::spawn(async move {
                    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                        .with_graceful_shutdown(shutdown.cancelled_owned())
                        .await
                })
            }
            Some(TlsMode::Manual(config)) => {
                let acceptor = tokio_rustls::TlsAcceptor::from(config);
                let stream = tls_listener::TlsListener::new(acceptor, listener);
                let listener = AxumListener { stream, local_addr }.tap_io(|_io| {});
                tokio::spawn(async move {
                    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                        .with_graceful_shutdown(shutdown.cancelled_owned())
                        .await
                })
            }
            Some(TlsMode::Acme(settings)) => {
                let listener = AxumListener {
                    stream: acme_stream(listener, settings),
                    local_addr,
                }
                .tap_io(|_io| {});
                tokio::spawn(async move {
                    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                        .with_graceful_shutdown(shutdown.cancelled_owned())
                        .await
                })
            }
        };
        Ok((task, local_addr))
    }
}

fn acme_stream(
    listener: TcpListener,
    settings: AcmeSettings,
) -> futures_util::stream::BoxStream<
    'static,
    std::io::Result<(impl AsyncRead + AsyncWrite + Unpin + Send + 'static, SocketAddr)>,
> {
    use rustls_acme::{AcmeConfig, caches::DirCache};

    let state = AcmeConfig::new(settings.domains)
        .contact(settings.email.iter().map(|email| format!("mailto:{email}")))
        .cache_option(settings.cache_dir.map(DirCache::new))
        .directory_lets_encrypt(settings.production)
        .state();

    state
        .incoming(
            TcpListenerStream::new(listener).map(|res| res.map(|s| s.compat())),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        )
        .filter_map(|res| async move {
            match res {
                Ok(stream) => {
                    let stream = stream.compat();
                    let addr = stream
                        .get_ref()
                        .get_ref()
                        .0
                        .get_ref()
                        .peer_addr()
                        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
                    Some(Ok::<_, std::io::Error>((stream, addr)))
                }
                Err(e) => {
                    tracing::debug!("TLS accept error: {}", e);
                    None
                }
            }
        })
        .boxed()
}

#[async_trait]
impl Component for HttpServer {
    fn name(&self) -> &'static str {
        "http_server"
    }

    async fn start(&self) -> RuntimeResult<()> {
        if !self
            .state
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
        {
            return Err(RuntimeError::AlreadyRunning);
        }

        let shutdown = self.parent.child_token();
        let (task, local_addr) = match self.spawn_server(shutdown.clone()).await {
            Ok(spawned) => spawned,
            Err(e) => {
                self.state.set(LifecycleState::Stopped);
                return Err(e);
            }
        };

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown);
        *self.task.lock().await = Some(task);
        self.state.set(LifecycleState::Running);
        tracing::info!(
            address = %local_addr,
            tls = self.tls.as_ref().is_some_and(|t| t.enabled()),
            "HTTP server listening"
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

        if let Some(shutdown) = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take() {
            shutdown.cancel();
        }
        let result = match self.task.lock().await.take() {
            Some(mut task) => {
                match tokio::time::timeout(self.config.shutdown_timeout, &mut task).await {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(RuntimeError::wrap("HTTP server failed", e)),
                    Ok(Err(join_error)) => Err(RuntimeError::wrap("HTTP server task failed", join_error)),
                    Err(_) => {
                        tracing::warn!(
                            "HTTP server did not drain within {:?}, aborting connections",
                            self.config.shutdown_timeout
                        );
                        task.abort();
                        Err(RuntimeError::TimedOut("http server shutdown".to_string()))
                    }
                }
            }
            None => Ok(()),
        };

        self.state.set(LifecycleState::Stopped);
        tracing::info!("HTTP server stopped");
        result
    }

    fn state(&self) -> LifecycleState {
        self.state.get()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use axum::{extract::ConnectInfo, http::Method};

    use super::*;
    use crate::{config::models::TlsConfig, core::router::RouteConfig};

    fn test_config() -> HttpConfig {
        HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    fn hello_router() -> Arc<Router> {
        let router = Arc::new(Router::new(None));
        router
            .add(Method::GET, "/hello", || async { "hello" }, RouteConfig::default())
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_plain_http_serves_and_stops() {
        let server = HttpServer::new(test_config(), hello_router(), None, CancellationToken::new());
        assert!(matches!(server.stop().await, Err(RuntimeError::NotRunning)));
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(RuntimeError::AlreadyRunning)));

        let addr = server.local_addr().unwrap();
        let body = reqwest::get(format!("http://{addr}/hello"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hello");

        server.stop().await.unwrap();
        assert_eq!(server.state(), LifecycleState::Stopped);
        assert!(reqwest::get(format!("http://{addr}/hello")).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_start() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = HttpConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };
        let server = HttpServer::new(config, hello_router(), None, CancellationToken::new());
        assert!(server.start().await.is_err());
        assert_eq!(server.state(), LifecycleState::Stopped);
    }

    fn write_cert(dir: &Path) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    #[tokio::test]
    async fn test_manual_tls() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_file, key_file) = write_cert(dir.path());
        let tls = Arc::new(TlsManager::new(TlsConfig {
            enabled: true,
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            ..Default::default()
        }));
        let router = hello_router();
        router
            .add(
                Method::GET,
                "/peer",
                |ConnectInfo(peer): ConnectInfo<SocketAddr>| async move { peer.ip().to_string() },
                RouteConfig::default(),
            )
            .unwrap();
        let server = HttpServer::new(test_config(), router, Some(tls.clone()), CancellationToken::new());
        assert!(server.start().await.is_err());

        tls.start().await.unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let body = client
            .get(format!("https://{addr}/hello"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hello");

        let peer = client
            .get(format!("https://{addr}/peer"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(peer, "127.0.0.1");
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_timeout_bounds_requests() {
        let router = Arc::new(Router::new(None));
        router
            .add(
                Method::GET,
                "/slow",
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                },
                RouteConfig::default(),
            )
            .unwrap();
        let config = HttpConfig {
            write_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let server = HttpServer::new(config, router, None, CancellationToken::new());
        server.start().await.unwrap();
        let response = reqwest::get(format!("http://{}/slow", server.local_addr().unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        server.stop().await.unwrap();
    }
}
