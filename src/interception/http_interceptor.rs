// src/interception/http_interceptor.rs
//! HTTP forward proxy feeding the archiver
//!
//! Forwards absolute-form requests to their origin and returns the upstream
//! response with its body teed to the archive. TLS interception is not
//! performed: `CONNECT` tunnels are relayed byte for byte.

use crate::recording::archiver::Archiver;
use crate::recording::event::ExchangeContext;
use crate::utils::errors::{ArchiveError, Result};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::{HttpConnector, HttpInfo};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Body type returned to proxy clients
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Connection-scoped headers that are not forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "upgrade",
];

/// HTTP forward proxy
pub struct HttpInterceptor {
    listen_addr: SocketAddr,
    archiver: Arc<Archiver>,
    http_client: Client<HttpConnector, Incoming>,
    sessions: AtomicI64,
}

impl HttpInterceptor {
    /// Create a new HTTP interceptor
    pub fn new(listen_addr: SocketAddr, archiver: Arc<Archiver>) -> Self {
        let http_client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            listen_addr,
            archiver,
            http_client,
            sessions: AtomicI64::new(0),
        }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.listen_addr).await.map_err(|e| {
            ArchiveError::InterceptionFailed(format!("Failed to bind proxy: {}", e))
        })
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn start(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Connections already accepted keep running.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| ArchiveError::InterceptionFailed(e.to_string()))?;
        info!("HTTP interceptor listening on {}", local);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("HTTP interceptor stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let interceptor = Arc::clone(&self);
                        tokio::spawn(async move {
                            debug!("Accepted connection from {}", addr);

                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let interceptor = Arc::clone(&interceptor);
                                async move { interceptor.handle_request(req, addr).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .preserve_header_case(true)
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    /// Handle one proxied request
    async fn handle_request(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session, "Intercepted request: {} {}", req.method(), req.uri());

        if req.method() == Method::CONNECT {
            return Ok(self.tunnel(req, session));
        }

        if req.uri().authority().is_none() {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "Proxy requests must use an absolute URI",
            ));
        }

        let request_uri = req.uri().clone();
        self.archiver.notify_request(
            Some(&req),
            ExchangeContext::new(session).with_remote_addr(client_addr.to_string()),
        );

        strip_hop_by_hop(req.headers_mut());

        match self.http_client.request(req).await {
            Ok(response) => {
                let mut ctx = ExchangeContext::new(session);
                if let Some(info) = response.extensions().get::<HttpInfo>() {
                    ctx = ctx.with_remote_addr(info.remote_addr().to_string());
                }

                let mut response = self.archiver.notify_response(response, request_uri, ctx);
                strip_hop_by_hop(response.headers_mut());
                Ok(response.map(|body| body.boxed_unsync()))
            }
            Err(e) => {
                warn!(session, "Upstream request to {} failed: {}", request_uri, e);
                Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "Failed to reach upstream server",
                ))
            }
        }
    }

    /// Relay a CONNECT tunnel without archiving it
    fn tunnel(&self, req: Request<Incoming>, session: i64) -> Response<ProxyBody> {
        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            return error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };

        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(session, "Tunnel upgrade failed: {}", e);
                    return;
                }
            };

            let mut server = match TcpStream::connect(authority.as_str()).await {
                Ok(server) => server,
                Err(e) => {
                    warn!(session, "Tunnel to {} failed: {}", authority, e);
                    return;
                }
            };

            let mut client = TokioIo::new(upgraded);
            match tokio::io::copy_bidirectional(&mut client, &mut server).await {
                Ok((up, down)) => {
                    debug!(session, "Tunnel to {} closed ({} up, {} down)", authority, up, down)
                }
                Err(e) => debug!(session, "Tunnel to {} ended: {}", authority, e),
            }
        });

        Response::new(
            Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Create error response
fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
