#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use axum::{body::Bytes, http::StatusCode, routing::any};
use keel::config::{HttpConfig, ServiceConfig};

/// Peer answering with `statuses` in order, then 200 forever.
pub struct ScriptedPeer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub bodies: Arc<Mutex<Vec<(String, Bytes)>>>,
}

impl ScriptedPeer {
    pub async fn start(statuses: Vec<u16>) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(statuses);

        let app = {
            let hits = hits.clone();
            let bodies = bodies.clone();
            axum::Router::new().fallback(any(move |uri: axum::http::Uri, body: Bytes| {
                let hits = hits.clone();
                let bodies = bodies.clone();
                let statuses = statuses.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    bodies.lock().unwrap().push((uri.path().to_string(), body));
                    let code = statuses.get(n).copied().unwrap_or(200);
                    (StatusCode::from_u16(code).unwrap(), "{}")
                }
            }))
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        Self { addr, hits, bodies }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Service config listening on an ephemeral local port.
pub fn local_service(name: &str) -> ServiceConfig {
    let mut config = ServiceConfig::named(name, "1.0.0");
    config.server.http = HttpConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    config
}
