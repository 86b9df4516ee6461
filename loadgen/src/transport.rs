//! HTTP transport shared by the write and query clients.

use bytes::Bytes;
use http::{Uri, uri::InvalidUri};
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::identity::Tenant;

/// The `User-Agent` of every request loadgen sends.
pub const USER_AGENT: &str = "cortex-load-generator";

/// Upper bound on the bytes read from an error response body.
pub(crate) const MAX_ERROR_MESSAGE_BYTES: usize = 256;

/// Request body type of every outbound request.
pub type Body = Full<Bytes>;

/// The plain HTTP client loadgen builds its tenant clients on.
pub type HttpClient = Client<HttpConnector, Body>;

/// An [`HttpClient`] stamping every request with a tenant id.
pub type TenantClient = Tenant<HttpClient>;

#[derive(thiserror::Error, Debug)]
/// Errors produced when validating a configured endpoint.
pub enum EndpointError {
    /// The endpoint is not a URI at all.
    #[error("Invalid endpoint {uri:?}: {source}")]
    Invalid {
        /// The rejected endpoint
        uri: String,
        /// Underlying parse error
        #[source]
        source: InvalidUri,
    },
    /// The endpoint has no host to connect to.
    #[error("Endpoint {0} has no host")]
    MissingAuthority(Uri),
    /// Only plain `http` endpoints are supported.
    #[error("Endpoint {0} must use the http scheme")]
    UnsupportedScheme(Uri),
}

/// Parse and validate an endpoint.
///
/// # Errors
///
/// See [`check_endpoint`]. Also fails if `uri` does not parse.
pub fn parse_endpoint(uri: &str) -> Result<Uri, EndpointError> {
    let parsed: Uri = uri.parse().map_err(|source| EndpointError::Invalid {
        uri: uri.to_string(),
        source,
    })?;
    check_endpoint(&parsed)?;
    Ok(parsed)
}

/// Check that `uri` is an absolute `http` URI.
///
/// # Errors
///
/// Fails if `uri` has no authority or uses a scheme other than `http`.
pub fn check_endpoint(uri: &Uri) -> Result<(), EndpointError> {
    if uri.authority().is_none() {
        return Err(EndpointError::MissingAuthority(uri.clone()));
    }
    if uri.scheme_str() != Some("http") {
        return Err(EndpointError::UnsupportedScheme(uri.clone()));
    }
    Ok(())
}

/// Build the pooled client both clients use, keeping at most `idle_per_host`
/// idle connections around.
pub(crate) fn client(idle_per_host: usize) -> HttpClient {
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(idle_per_host)
        .retry_canceled_requests(false)
        .build_http()
}

/// Read at most `limit` bytes from `body`, discarding the rest.
pub(crate) async fn read_prefix<B>(mut body: B, limit: usize) -> Result<Vec<u8>, B::Error>
where
    B: hyper::body::Body<Data = Bytes> + Unpin,
{
    let mut buf = Vec::with_capacity(limit);
    while buf.len() < limit {
        let Some(frame) = body.frame().await else {
            break;
        };
        if let Ok(data) = frame?.into_data() {
            let take = data.len().min(limit - buf.len());
            buf.extend_from_slice(&data[..take]);
        }
    }
    Ok(buf)
}

/// The first line of `bytes`, lossily decoded.
pub(crate) fn first_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.lines().next().unwrap_or_default().trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_must_be_absolute_http() {
        assert!(parse_endpoint("http://localhost:9009/api/v1/push").is_ok());
        assert!(matches!(
            parse_endpoint("/api/v1/push"),
            Err(EndpointError::MissingAuthority(_))
        ));
        assert!(matches!(
            parse_endpoint("https://localhost:9009/api/v1/push"),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse_endpoint("http://local host"),
            Err(EndpointError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn read_prefix_stops_at_limit() {
        let body = Full::new(Bytes::from(vec![b'x'; 1024]));
        let prefix = read_prefix(body, MAX_ERROR_MESSAGE_BYTES)
            .await
            .expect("infallible body");
        assert_eq!(prefix.len(), MAX_ERROR_MESSAGE_BYTES);

        let body = Full::new(Bytes::from_static(b"short"));
        let prefix = read_prefix(body, MAX_ERROR_MESSAGE_BYTES)
            .await
            .expect("infallible body");
        assert_eq!(prefix, b"short");
    }

    #[test]
    fn first_line_drops_the_rest() {
        assert_eq!(first_line(b"too many series\nsecond line"), "too many series");
        assert_eq!(first_line(b"windows\r\nline"), "windows");
        assert_eq!(first_line(b""), "");
    }
}
