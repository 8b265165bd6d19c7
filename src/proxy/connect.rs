//! Request handling for the filtering proxy.
//!
//! Two request shapes are supported:
//!
//! 1. `CONNECT host:port` for HTTPS. The destination is checked, a raw TCP
//!    connection is opened, the client gets `200 Connection Established`, and
//!    bytes are relayed in both directions until either side closes. TLS is
//!    never terminated here.
//! 2. Absolute-form plain HTTP (`GET http://host/path`). The destination is
//!    checked and the request is forwarded to the origin over a fresh
//!    HTTP/1.1 connection with header case preserved.
//!
//! A denied destination gets `403 Forbidden` with a `text/plain` body.

use super::allowlist::DomainAllowlist;
use super::approval::DomainApprovalGate;
use super::error::{ProxyError, ProxyResult};
use crate::telemetry::{AllowReason, AuditEvent, AuditLogger, BlockReason, Decision};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Response type produced by every handler.
pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Shared state consulted by every request.
pub struct ProxyContext {
    /// Allowed destinations; approved hosts are appended at runtime.
    pub allowlist: Arc<DomainAllowlist>,
    /// Approval gate for unknown hosts, if one is wired.
    pub approval: Option<Arc<DomainApprovalGate>>,
    /// Whether unknown hosts should be sent to the approval gate at all.
    pub require_approval: bool,
    /// Audit sink.
    pub audit: Arc<AuditLogger>,
}

impl ProxyContext {
    /// Decide whether `host` may be contacted.
    ///
    /// Allowlisted hosts pass immediately. Otherwise, when approval is
    /// required and a gate is present, the gate is consulted and an approved
    /// host is added to the allowlist for subsequent requests.
    pub async fn authorize(&self, host: &str) -> bool {
        if self.allowlist.is_allowed(host) {
            debug!("Allowing {} (allowlist)", host);
            self.audit.log(AuditEvent::NetworkAllow {
                domain: host.to_string(),
                reason: AllowReason::Allowlist,
            });
            return true;
        }

        let gate = match (&self.approval, self.require_approval) {
            (Some(gate), true) => gate,
            _ => {
                info!("Blocking {}: not on the allowlist", host);
                self.audit.log(AuditEvent::NetworkBlock {
                    domain: host.to_string(),
                    reason: BlockReason::NotAllowlisted,
                });
                return false;
            }
        };

        let approved = gate.request_approval(host).await;
        self.audit.log(AuditEvent::NetworkPrompt {
            domain: host.to_string(),
            decision: Decision::from(approved),
        });

        if approved {
            self.allowlist.add(host);
            info!("Allowing {} (approved)", host);
            self.audit.log(AuditEvent::NetworkAllow {
                domain: host.to_string(),
                reason: AllowReason::Approved,
            });
        } else {
            info!("Blocking {}: approval denied", host);
            self.audit.log(AuditEvent::NetworkBlock {
                domain: host.to_string(),
                reason: BlockReason::UserDenied,
            });
        }
        approved
    }
}

/// Handle an HTTP CONNECT request.
pub async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> ProxyResult<ProxyResponse> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .ok_or_else(|| ProxyError::InvalidRequest("Missing authority in CONNECT request".into()))?;
    let (host, port) = parse_host_port(&authority, 443)?;

    debug!("CONNECT request to {}:{}", host, port);

    if !ctx.authorize(&host).await {
        return Ok(forbidden_response(&format!("Domain {} is not allowed", host)));
    }

    let upstream = connect_upstream(&host, port).await?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => match tunnel(upgraded, upstream).await {
                Ok((sent, received)) => {
                    debug!(
                        "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
                        host, port, sent, received
                    );
                }
                Err(e) => debug!("Tunnel to {}:{} ended: {}", host, port, e),
            },
            Err(e) => warn!("{} ({}:{})", ProxyError::UpgradeFailed(e.to_string()), host, port),
        }
    });

    Ok(connection_established())
}

/// Handle a plain (absolute-form) HTTP proxy request.
pub async fn handle_http(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> ProxyResult<ProxyResponse> {
    let uri = req.uri();
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest("Missing host in request URI".into()))?;
    let port = uri.port_u16().unwrap_or(80);

    debug!("HTTP proxy request to {}:{}", host, port);

    if !ctx.authorize(&host).await {
        return Ok(forbidden_response(&format!("Domain {} is not allowed", host)));
    }

    forward_http_request(req, &host, port).await
}

/// Relay bytes between the upgraded client connection and the upstream.
async fn tunnel(upgraded: Upgraded, mut upstream: TcpStream) -> std::io::Result<(u64, u64)> {
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await
}

/// Forward an HTTP request to its origin over a dedicated connection.
async fn forward_http_request(
    req: Request<Incoming>,
    host: &str,
    port: u16,
) -> ProxyResult<ProxyResponse> {
    let stream = connect_upstream(host, port).await?;

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;

    let origin = format!("{}:{}", host, port);
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection to {} ended: {}", origin, e);
        }
    });

    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}

async fn connect_upstream(host: &str, port: u16) -> ProxyResult<TcpStream> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })
}

/// Parse `host:port` from a request authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", `default_port`)
/// - `[::1]:8443` -> ("::1", 8443)
pub(crate) fn parse_host_port(
    authority: &str,
    default_port: u16,
) -> ProxyResult<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) if !host.contains(':') || host.ends_with(']') => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", port_str)))?;
            (host, port)
        }
        _ => (authority, default_port),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::InvalidRequest(format!(
            "Missing host in authority: {}",
            authority
        )));
    }
    Ok((host.to_string(), port))
}

/// Map a handler error to the response the client should see.
pub(crate) fn error_response(err: &ProxyError) -> ProxyResponse {
    let status = match err {
        ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ProxyError::UpstreamConnect { .. } | ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_response(status, err.to_string())
}

/// Create an empty response body.
fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, message: String) -> ProxyResponse {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Create a 403 Forbidden response.
fn forbidden_response(message: &str) -> ProxyResponse {
    text_response(StatusCode::FORBIDDEN, message.to_string())
}

/// `200 Connection Established`, which starts the upgrade.
fn connection_established() -> ProxyResponse {
    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}
