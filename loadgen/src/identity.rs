//! Tenant identity for outbound requests.
//!
//! Multi-tenant backends isolate data by the `X-Scope-OrgID` header. Every
//! request loadgen sends, write or query, passes through [`Tenant`] which
//! stamps that header with the tenant id the client was built for.

use std::task::{Context, Poll};

use http::{HeaderName, HeaderValue, Request, header::InvalidHeaderValue};
use tower::{Layer, Service};

/// Name of the header carrying the tenant id.
pub const TENANT_HEADER: &str = "x-scope-orgid";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`TenantLayer`].
pub enum Error {
    /// The tenant id cannot be sent as a header value.
    #[error("Tenant id {tenant:?} is not a valid header value: {source}")]
    InvalidTenant {
        /// The rejected tenant id
        tenant: String,
        /// Underlying header error
        #[source]
        source: InvalidHeaderValue,
    },
}

/// A [`Layer`] wrapping services in [`Tenant`].
#[derive(Debug, Clone)]
pub struct TenantLayer {
    tenant: HeaderValue,
}

impl TenantLayer {
    /// Create a new [`TenantLayer`] for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns an error if `tenant` contains bytes not allowed in a header
    /// value.
    pub fn new(tenant: &str) -> Result<Self, Error> {
        let tenant = HeaderValue::from_str(tenant).map_err(|source| Error::InvalidTenant {
            tenant: tenant.to_string(),
            source,
        })?;
        Ok(Self { tenant })
    }
}

impl<S> Layer<S> for TenantLayer {
    type Service = Tenant<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Tenant {
            inner,
            tenant: self.tenant.clone(),
        }
    }
}

/// Sets the tenant header on every request before handing it to the inner
/// service. Any tenant header already present is replaced.
#[derive(Debug, Clone)]
pub struct Tenant<S> {
    inner: S,
    tenant: HeaderValue,
}

impl<S> Tenant<S> {
    /// The tenant id stamped on requests.
    #[must_use]
    pub fn tenant(&self) -> &HeaderValue {
        &self.tenant
    }
}

impl<S, B> Service<Request<B>> for Tenant<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<B>) -> Self::Future {
        request
            .headers_mut()
            .insert(HeaderName::from_static(TENANT_HEADER), self.tenant.clone());
        self.inner.call(request)
    }
}
