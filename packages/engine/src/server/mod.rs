// packages/engine/src/server/mod.rs
//! HTTP surface
//!
//! | Route | Operation |
//! |---|---|
//! | `POST /add-event` | discriminate (optional) then `Store::add` |
//! | `GET /list-events` | `Store::list`, raw blocks or JSON |
//! | `POST /update-session-matcher` | replace a session matcher |
//! | `POST /tail` | stream tailed sessions as JSON lines |
//! | `GET /metrics` | Prometheus text |

pub mod handlers;

use crate::discrimination::{
    Discriminate, Discriminator, DiscriminatorConfig, MatcherRegistry, SessionTailRegistry,
};
use crate::recording::Store;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Only store sessions the discriminator keeps
    pub discriminate_on_ingest: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1026,
            discriminate_on_ingest: true,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| EngineError::ConfigInvalid(format!("listen address: {}", e)))
    }
}

/// State shared by every connection
pub struct AppState {
    pub store: Store,
    pub discriminator: Mutex<Box<dyn Discriminate>>,
    pub matchers: Arc<MatcherRegistry>,
    pub tails: Arc<SessionTailRegistry>,
    pub discriminator_config: DiscriminatorConfig,
    pub discriminate_on_ingest: bool,
    pub metrics: Option<PrometheusHandle>,

    /// Cancelled on shutdown; tail loops run on child tokens
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire a [`Discriminator`] over fresh registries
    pub fn new(config: &EngineConfig, store: Store, metrics: Option<PrometheusHandle>) -> Self {
        let matchers = Arc::new(MatcherRegistry::new());
        let tails = Arc::new(SessionTailRegistry::new(
            config.discriminator.tail_mailbox_capacity,
        ));
        let discriminator = Discriminator::new(
            &config.discriminator,
            Arc::clone(&matchers),
            Arc::clone(&tails),
        );
        Self {
            store,
            discriminator: Mutex::new(Box::new(discriminator)),
            matchers,
            tails,
            discriminator_config: config.discriminator.clone(),
            discriminate_on_ingest: config.server.discriminate_on_ingest,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the discriminator, e.g. with a test double
    pub fn with_discriminator(mut self, discriminator: Box<dyn Discriminate>) -> Self {
        self.discriminator = Mutex::new(discriminator);
        self
    }
}

/// HTTP/1 server over [`AppState`]
pub struct EventServer {
    state: Arc<AppState>,
}

impl EventServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Bind the configured address and serve until shutdown
    pub async fn bind(self, config: &ServerConfig) -> Result<()> {
        let listener = TcpListener::bind(config.listen_addr()?).await?;
        self.serve(listener).await
    }

    /// Accept connections until the shutdown token is cancelled
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Event server listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.state.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        debug!("Accepted connection from {}", addr);

                        let io = TokioIo::new(stream);

                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handlers::route(state, req).await }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Event server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::StoreConfig;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{Method, Request};
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use tempfile::tempdir;

    #[test]
    fn test_default_listen_addr() {
        let addr = ServerConfig::default().listen_addr().unwrap();
        assert_eq!(addr.port(), 1026);
    }

    #[tokio::test]
    async fn test_serve_add_event_over_http() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.store = StoreConfig {
            root_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        config.server.discriminate_on_ingest = false;
        let store = Store::new(config.store.clone()).unwrap();
        let state = Arc::new(AppState::new(&config, store, None));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(EventServer::new(Arc::clone(&state)).serve(listener));

        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{}/add-event", addr))
            .body(Full::new(Bytes::from_static(b"{\"url\":\"/hello\"}")))
            .unwrap();
        let response = client.request(request).await.unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{\"errno\":0}");
        assert_eq!(state.store.queue_stats().current_size, 1);

        state.shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
