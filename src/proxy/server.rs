//! Local HTTP proxy server.
//!
//! The proxy binds to `127.0.0.1` on the configured port (0 picks an
//! ephemeral port) and serves HTTP/1.1 with upgrade support for CONNECT.
//! Each accepted connection is handled in its own Tokio task.
//!
//! [`ProxyServer::start`] and [`ProxyServer::stop`] are idempotent. Stopping
//! signals the accept loop and waits for it to exit, so the listening port
//! is released when `stop` returns. Tunnels already established are left to
//! finish on their own.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), shellguard::proxy::ProxyError> {
//! use shellguard::proxy::{DomainAllowlist, ProxyServerBuilder};
//! use std::sync::Arc;
//!
//! let server = ProxyServerBuilder::new()
//!     .port(0)
//!     .allowlist(Arc::new(DomainAllowlist::new(["pypi.org"])))
//!     .build();
//!
//! let addr = server.start().await?;
//! println!("HTTP_PROXY=http://{}", addr);
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use super::allowlist::DomainAllowlist;
use super::approval::DomainApprovalGate;
use super::connect::{ProxyContext, ProxyResponse, error_response, handle_connect, handle_http};
use super::error::{ProxyError, ProxyResult};
use crate::telemetry::AuditLogger;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Port to bind on the loopback interface. 0 selects an ephemeral port.
    pub port: u16,
    /// Whether unknown domains are sent to the approval gate.
    pub require_approval: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: crate::config::DEFAULT_HTTP_PROXY_PORT,
            require_approval: true,
        }
    }
}

/// Handle to the running accept loop.
struct RunningProxy {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// The filtering proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    context: Arc<ProxyContext>,
    /// Serializes start and stop.
    running: Mutex<Option<RunningProxy>>,
    /// Mirror of the bound address for synchronous readers.
    bound: RwLock<Option<SocketAddr>>,
}

impl ProxyServer {
    /// Create a stopped proxy server.
    pub fn new(
        config: ProxyConfig,
        allowlist: Arc<DomainAllowlist>,
        approval: Option<Arc<DomainApprovalGate>>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let context = ProxyContext {
            allowlist,
            approval,
            require_approval: config.require_approval,
            audit,
        };
        Self {
            config,
            context: Arc::new(context),
            running: Mutex::new(None),
            bound: RwLock::new(None),
        }
    }

    /// The server's configuration.
    pub fn config(&self) -> ProxyConfig {
        self.config
    }

    /// The shared allowlist. Runtime approvals show up here.
    pub fn allowlist(&self) -> Arc<DomainAllowlist> {
        self.context.allowlist.clone()
    }

    /// Bind and start accepting connections.
    ///
    /// Returns the bound address. If the server is already running this is
    /// a no-op that returns the existing address.
    pub async fn start(&self) -> ProxyResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(existing) = running.as_ref() {
            debug!("Proxy already running on {}", existing.addr);
            return Ok(existing.addr);
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.config.port))
            .await
            .map_err(|source| ProxyError::Bind {
                port: self.config.port,
                source,
            })?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, self.context.clone(), shutdown_rx));

        *running = Some(RunningProxy {
            addr,
            shutdown_tx,
            accept_task,
        });
        *self.bound.write().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        info!("Proxy listening on {}", addr);
        Ok(addr)
    }

    /// Stop accepting connections and release the port.
    ///
    /// A no-op if the server is not running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(proxy) = running.take() else {
            return;
        };
        *self.bound.write().unwrap_or_else(PoisonError::into_inner) = None;

        let _ = proxy.shutdown_tx.send(true);
        if let Err(e) = proxy.accept_task.await {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }
        info!("Proxy on {} stopped", proxy.addr);
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Address the proxy is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// `http://127.0.0.1:<port>` for the running proxy.
    pub fn proxy_url(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| format!("http://127.0.0.1:{}", addr.port()))
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(proxy) = self.running.get_mut().take() {
            let _ = proxy.shutdown_tx.send(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ProxyContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!("Accepted proxy connection from {}", peer);
                        spawn_connection_handler(stream, context.clone());
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Proxy accept loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection_handler(stream: TcpStream, context: Arc<ProxyContext>) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, context).await {
            // Resets and early closes are routine for proxied clients.
            if e.is_incomplete_message() || e.is_canceled() {
                debug!("Connection ended: {}", e);
            } else {
                warn!("Connection error: {}", e);
            }
        }
    });
}

/// Serve one client connection.
async fn handle_connection(
    stream: TcpStream,
    context: Arc<ProxyContext>,
) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = context.clone();
        async move { Ok::<_, Infallible>(proxy_request(req, context).await) }
    });

    // Upgrades are needed for CONNECT.
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
}

/// Process a single proxy request.
async fn proxy_request(req: Request<Incoming>, context: Arc<ProxyContext>) -> ProxyResponse {
    let result = if req.method() == Method::CONNECT {
        handle_connect(req, context).await
    } else {
        handle_http(req, context).await
    };

    result.unwrap_or_else(|e| {
        debug!("Proxy request failed: {}", e);
        error_response(&e)
    })
}

/// Builder for [`ProxyServer`].
pub struct ProxyServerBuilder {
    config: ProxyConfig,
    allowlist: Option<Arc<DomainAllowlist>>,
    approval: Option<Arc<DomainApprovalGate>>,
    audit: Option<Arc<AuditLogger>>,
}

impl ProxyServerBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            allowlist: None,
            approval: None,
            audit: None,
        }
    }

    /// Set the listening port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set whether unknown domains go to the approval gate.
    pub fn require_approval(mut self, require: bool) -> Self {
        self.config.require_approval = require;
        self
    }

    /// Set the allowlist.
    pub fn allowlist(mut self, allowlist: Arc<DomainAllowlist>) -> Self {
        self.allowlist = Some(allowlist);
        self
    }

    /// Set the approval gate.
    pub fn approval(mut self, gate: Arc<DomainApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Set the audit logger.
    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Build the proxy server. Unset parts default to an empty allowlist,
    /// no approval gate, and a null audit logger.
    pub fn build(self) -> ProxyServer {
        ProxyServer::new(
            self.config,
            self.allowlist.unwrap_or_default(),
            self.approval,
            self.audit
                .unwrap_or_else(|| Arc::new(AuditLogger::new_null())),
        )
    }
}

impl Default for ProxyServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let server = ProxyServerBuilder::new().build();
        assert_eq!(server.config().port, crate::config::DEFAULT_HTTP_PROXY_PORT);
        assert!(server.config().require_approval);
        assert!(server.allowlist().is_empty());
        assert!(!server.is_running());
        assert!(server.proxy_url().is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let allowlist = Arc::new(DomainAllowlist::new(["pypi.org"]));
        let server = ProxyServerBuilder::new()
            .port(0)
            .require_approval(false)
            .allowlist(allowlist.clone())
            .build();

        assert_eq!(server.config().port, 0);
        assert!(!server.config().require_approval);
        assert!(Arc::ptr_eq(&server.allowlist(), &allowlist));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = ProxyServerBuilder::new().port(0).build();

        let first = server.start().await.unwrap();
        let second = server.start().await.unwrap();
        assert_eq!(first, second);
        assert!(first.ip().is_loopback());
        assert_eq!(
            server.proxy_url(),
            Some(format!("http://127.0.0.1:{}", first.port()))
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let server = ProxyServerBuilder::new().port(0).build();
        let addr = server.start().await.unwrap();

        server.stop().await;
        assert!(!server.is_running());

        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok(), "port {} still held", addr.port());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let server = ProxyServerBuilder::new().port(0).build();
        server.stop().await;
        server.stop().await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = ProxyServerBuilder::new().port(0).build();
        server.start().await.unwrap();
        server.stop().await;
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = ProxyServerBuilder::new().port(port).build();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(!server.is_running());
    }
}
