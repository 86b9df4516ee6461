//! A reverse proxy that stamps a fixed tenant id on every request.
//!
//! Handy for pointing tools that know nothing about tenants, a browser or a
//! dashboard, at a multi-tenant backend. Request bodies are buffered before
//! they are forwarded.

use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode, Uri, header::HOST};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::{
    identity::{self, TenantLayer},
    transport::{self, EndpointError, TenantClient},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Proxy`]
pub enum Error {
    /// The tenant id is unusable.
    #[error(transparent)]
    Identity(#[from] identity::Error),
    /// The remote is unusable.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The forwarded request could not be built.
    #[error("Failed to build forwarded request: {0}")]
    Http(#[from] http::Error),
    /// The forwarded request could not be sent.
    #[error("Forwarded request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    /// The incoming request body could not be read.
    #[error("Failed to read request body: {0}")]
    Body(#[from] hyper::Error),
}

/// Response body of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Forwards requests to a single remote on behalf of one tenant.
#[derive(Debug, Clone)]
pub struct Proxy {
    client: TenantClient,
    remote: Uri,
    host: HeaderValue,
}

impl Proxy {
    /// Create a new [`Proxy`] forwarding to `remote` as `tenant`.
    ///
    /// # Errors
    ///
    /// Function will error if `remote` is not an absolute `http` URI or if
    /// `tenant` is not a valid header value.
    pub fn new(remote: Uri, tenant: &str) -> Result<Self, Error> {
        transport::check_endpoint(&remote)?;
        let host = remote
            .authority()
            .map(|authority| HeaderValue::from_str(authority.as_str()))
            .transpose()
            .map_err(|_| EndpointError::MissingAuthority(remote.clone()))?
            .ok_or_else(|| EndpointError::MissingAuthority(remote.clone()))?;
        let client = TenantLayer::new(tenant)?.layer(transport::client(usize::MAX));
        Ok(Self {
            client,
            remote,
            host,
        })
    }

    /// Forward `request` to the remote, keeping its method, path, query and
    /// headers but replacing the host and the tenant header.
    ///
    /// # Errors
    ///
    /// Function will error if the request body cannot be read or the remote
    /// cannot be reached.
    pub async fn forward<B>(&self, request: Request<B>) -> Result<Response<ProxyBody>, Error>
    where
        B: hyper::body::Body<Data = Bytes, Error = hyper::Error>,
    {
        let (mut parts, body) = request.into_parts();
        let body = body.collect().await?.to_bytes();

        let mut uri = Uri::builder();
        if let Some(scheme) = self.remote.scheme() {
            uri = uri.scheme(scheme.clone());
        }
        if let Some(authority) = self.remote.authority() {
            uri = uri.authority(authority.clone());
        }
        let path = parts
            .uri
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str());
        parts.uri = uri.path_and_query(path).build()?;
        parts.headers.insert(HOST, self.host.clone());

        let forwarded = Request::from_parts(parts, Full::new(body));
        let response = self.client.clone().oneshot(forwarded).await?;
        Ok(response.map(BodyExt::boxed))
    }

    /// Forward `request`, answering `502 Bad Gateway` if that fails.
    async fn handle(&self, request: Request<Incoming>) -> Response<ProxyBody> {
        let method = request.method().clone();
        let uri = request.uri().clone();
        match self.forward(request).await {
            Ok(response) => {
                debug!("{method} {uri} -> {status}", status = response.status());
                response
            }
            Err(err) => {
                warn!("Failed to forward {method} {uri}: {err}");
                let mut response = Response::new(full(err.to_string()));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }
}

fn full(message: String) -> ProxyBody {
    Full::new(Bytes::from(message))
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Serve `proxy` on `listener` until `shutdown` is cancelled.
///
/// Connections still open at shutdown are dropped.
///
/// # Errors
///
/// Function will error if the listener's address cannot be read.
pub async fn serve(listener: TcpListener, proxy: Proxy, shutdown: CancellationToken) -> Result<(), Error> {
    info!(
        "proxying {addr} to {remote} as tenant {tenant:?}",
        addr = listener.local_addr()?,
        remote = proxy.remote,
        tenant = proxy.client.tenant(),
    );
    let proxy = Arc::new(proxy);
    let mut join_set = JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping accept loop.");
                break;
            }

            incoming = listener.accept() => {
                let (stream, addr) = match incoming {
                    Ok(sa) => sa,
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        continue;
                    }
                };
                debug!("Accepted connection from {addr}");

                let proxy = Arc::clone(&proxy);
                join_set.spawn(async move {
                    let service = service_fn(move |request| {
                        let proxy = Arc::clone(&proxy);
                        async move { Ok::<_, Infallible>(proxy.handle(request).await) }
                    });
                    let builder = auto::Builder::new(TokioExecutor::new());
                    if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                        error!("Error serving {addr}: {e}");
                    }
                });
            }
        }
    }

    drop(listener);
    join_set.shutdown().await;
    Ok(())
}
