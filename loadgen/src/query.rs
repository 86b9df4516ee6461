//! The query client.
//!
//! Reads back what the write client of the same tenant produced. Every
//! `interval` the client derives a window that writes have had time to land
//! in, runs the default aggregation query plus any additional queries over
//! it, and compares the default query's samples against the locally
//! recomputed sine wave. The two clients share no state: the expected values
//! come from the same pure generator the write path uses.

use std::{num::ParseFloatError, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::join_all;
use http::{Method, Request, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full};
use loadgen_series::{Sample, align_to_interval, duration_millis};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::{
    counters::{CounterStore, Labels, Outcome, QUERIES_TOTAL, RESULTS_COMPARED_TOTAL},
    identity::{self, TenantLayer},
    now_millis, run_ticks,
    transport::{self, EndpointError, MAX_ERROR_MESSAGE_BYTES, TenantClient},
    verify,
};

/// The query whose result is verified: the sum of every sine series.
pub const DEFAULT_QUERY: &str = "sum(cortex_load_generator_sine_wave)";

/// Upper bound on the samples a single range query may request.
pub const MAX_SAMPLES: i64 = 1000;

const QUERY_RANGE_PATH: &str = "/api/v1/query_range";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`QueryClient`]
pub enum Error {
    /// The tenant id is unusable.
    #[error(transparent)]
    Identity(#[from] identity::Error),
    /// The query endpoint is unusable.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// Query and write intervals must be positive.
    #[error("Query interval and write interval must be positive")]
    ZeroInterval,
    /// Building the request failed.
    #[error("Failed to build query request: {0}")]
    Http(#[from] http::Error),
    /// Encoding the query parameters failed.
    #[error("Failed to encode query parameters: {0}")]
    Params(#[from] serde_qs::Error),
    /// The request could not be sent.
    #[error("Query request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    /// The response body could not be read.
    #[error("Failed to read query response: {0}")]
    Body(#[from] hyper::Error),
    /// The request did not complete within the query timeout.
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
    /// The backend answered with a non-2xx status.
    #[error("Query returned status {status}: {message}")]
    Status {
        /// Response status
        status: StatusCode,
        /// First line of the response body
        message: String,
    },
    /// The response body is not a query API envelope.
    #[error("Failed to decode query response: {0}")]
    Json(#[from] serde_json::Error),
    /// The backend reported an error inside a query API envelope.
    #[error("Query API returned {error_type}: {error}")]
    Api {
        /// Category of the error, `errorType` in the envelope
        error_type: String,
        /// Error message
        error: String,
    },
    /// The result is not a range vector.
    #[error("Expected a matrix result but got {0}")]
    ResultType(String),
    /// A sample value could not be parsed.
    #[error("Invalid sample value {value:?}: {source}")]
    Value {
        /// The raw value
        value: String,
        /// Underlying parse error
        #[source]
        source: ParseFloatError,
    },
}

/// Configuration of a single tenant's [`QueryClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Base URL of the query API, `/api/v1/query_range` is appended to its
    /// path.
    pub url: Uri,
    /// Tenant id sent with every query.
    pub tenant: String,
    /// Time between query ticks.
    pub interval: Duration,
    /// Deadline of a single query.
    pub timeout: Duration,
    /// Oldest data a query window may reach back to.
    pub max_age: Duration,
    /// Number of sine series the tenant's write client produces.
    pub expected_series: usize,
    /// Write interval of the tenant's write client.
    pub write_interval: Duration,
    /// Relative tolerance when comparing sample values.
    pub tolerance: f64,
    /// Queries that are run and counted but not compared.
    pub additional_queries: Vec<String>,
}

/// A closed query window, milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// First timestamp of the window
    pub start: i64,
    /// Last timestamp of the window
    pub end: i64,
}

/// Compute the window eligible for querying at `now`.
///
/// The window ends two write intervals before `now` so in-flight writes can
/// land. It starts no earlier than `max_age` before `now` and no earlier than
/// two write intervals after `started`, since data from before the client
/// started may have been written with a different configuration. Both ends
/// are aligned down to the write interval. Returns `None` unless the end is
/// strictly after the start.
#[must_use]
pub fn time_range(now: i64, started: i64, write_interval: Duration, max_age: Duration) -> Option<Range> {
    let grace = duration_millis(write_interval).saturating_mul(2);
    let end = align_to_interval(now.saturating_sub(grace), write_interval);
    let start = now
        .saturating_sub(duration_millis(max_age))
        .max(started.saturating_add(grace));
    let start = align_to_interval(start, write_interval);
    (end > start).then_some(Range { start, end })
}

/// Compute the step of a range query over `range`.
///
/// This is `write_interval` if querying every written sample stays within
/// [`MAX_SAMPLES`], otherwise the smallest multiple of `write_interval` that
/// does.
#[must_use]
pub fn query_step(range: Range, write_interval: Duration) -> Duration {
    let interval = duration_millis(write_interval);
    if interval == 0 {
        return write_interval;
    }
    let span = range.end.saturating_sub(range.start);
    if span / interval <= MAX_SAMPLES {
        return write_interval;
    }
    let multiple = span / ((MAX_SAMPLES + 1) * interval) + 1;
    let step = u64::try_from(multiple.saturating_mul(interval)).unwrap_or(u64::MAX);
    Duration::from_millis(step)
}

#[derive(Debug, Serialize)]
struct RangeParams<'a> {
    query: &'a str,
    start: String,
    end: String,
    step: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    status: String,
    #[serde(default)]
    data: Option<Data>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Data {
    result_type: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Stream {
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn seconds(millis: i64) -> String {
    (millis as f64 / 1000.0).to_string()
}

#[allow(clippy::cast_possible_truncation)]
fn decode_samples(stream: Stream) -> Result<Vec<Sample>, Error> {
    stream
        .values
        .into_iter()
        .map(|(timestamp, value)| {
            let parsed = value
                .parse::<f64>()
                .map_err(|source| Error::Value { value, source })?;
            Ok(Sample {
                value: parsed,
                timestamp: (timestamp * 1000.0).round() as i64,
            })
        })
        .collect()
}

/// Decode a query API response body into the samples of every returned
/// series.
fn decode_matrix(body: &[u8]) -> Result<Vec<Vec<Sample>>, Error> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    if envelope.status != "success" {
        return Err(Error::Api {
            error_type: envelope.error_type.unwrap_or(envelope.status),
            error: envelope.error.unwrap_or_default(),
        });
    }
    let Some(data) = envelope.data else {
        return Err(Error::ResultType("nothing".to_string()));
    };
    if data.result_type != "matrix" {
        return Err(Error::ResultType(data.result_type));
    }
    let streams: Vec<Stream> = serde_json::from_value(data.result)?;
    streams.into_iter().map(decode_samples).collect()
}

/// Periodically queries a tenant's data back and verifies it.
#[derive(Debug)]
pub struct QueryClient {
    config: Config,
    client: TenantClient,
    started: i64,
    counters: Arc<dyn CounterStore>,
}

impl QueryClient {
    /// Create a new [`QueryClient`]. The client considers itself started
    /// from this moment.
    ///
    /// Every counter the client may increment is registered at zero.
    ///
    /// # Errors
    ///
    /// Function will error if the URL is not an absolute `http` URI, if the
    /// tenant id is not a valid header value or if an interval is zero.
    pub fn new(config: Config, counters: Arc<dyn CounterStore>) -> Result<Self, Error> {
        transport::check_endpoint(&config.url)?;
        if config.interval.is_zero() || config.write_interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        let client = TenantLayer::new(&config.tenant)?
            .layer(transport::client(1 + config.additional_queries.len()));

        let labels = Labels::tenant(&config.tenant);
        for outcome in [Outcome::Success, Outcome::Failed, Outcome::Skipped] {
            for query in std::iter::once(DEFAULT_QUERY)
                .chain(config.additional_queries.iter().map(String::as_str))
            {
                let labels = labels.clone().with_outcome(outcome).with_query(query).build();
                counters.increment(QUERIES_TOTAL, &labels, 0);
            }
        }
        for outcome in [Outcome::Success, Outcome::Failed] {
            let labels = labels
                .clone()
                .with_outcome(outcome)
                .with_query(DEFAULT_QUERY)
                .build();
            counters.increment(RESULTS_COMPARED_TOTAL, &labels, 0);
        }

        Ok(Self {
            config,
            client,
            started: now_millis(),
            counters,
        })
    }

    /// Run the client until `shutdown` is cancelled.
    ///
    /// The first tick fires immediately. Ticks that come due while the
    /// previous one is still running are skipped. Shutdown is only observed
    /// between ticks.
    pub async fn spin(self, shutdown: CancellationToken) {
        run_ticks(self.config.interval, shutdown, |now| self.run_queries(now)).await;
        info!("shutdown signal received");
    }

    /// Run a single tick as of `now`, milliseconds since the epoch.
    pub async fn run_queries(&self, now: i64) {
        let Some(range) = time_range(
            now,
            self.started,
            self.config.write_interval,
            self.config.max_age,
        ) else {
            debug!("skipped querying because no eligible time range to query");
            self.count(QUERIES_TOTAL, Outcome::Skipped, DEFAULT_QUERY);
            return;
        };
        let step = query_step(range, self.config.write_interval);

        let additional = self
            .config
            .additional_queries
            .iter()
            .map(|query| self.run_counted(range, step, query));
        tokio::join!(self.run_default_query(range, step), join_all(additional));
    }

    async fn run_default_query(&self, range: Range, step: Duration) {
        let Some(streams) = self.run_counted(range, step, DEFAULT_QUERY).await else {
            return;
        };

        let outcome = if let [samples] = streams.as_slice() {
            let mismatches = verify::verify_sine_samples(
                samples,
                self.config.expected_series,
                step,
                self.config.tolerance,
            );
            for mismatch in &mismatches {
                warn!(query = DEFAULT_QUERY, "query result comparison failed: {mismatch}");
            }
            if mismatches.is_empty() {
                Outcome::Success
            } else {
                Outcome::Failed
            }
        } else {
            warn!(
                query = DEFAULT_QUERY,
                "query result comparison failed: expected 1 series in the result but got {}",
                streams.len()
            );
            Outcome::Failed
        };
        self.count(RESULTS_COMPARED_TOTAL, outcome, DEFAULT_QUERY);
    }

    /// Run `query` and count its outcome. Returns the result on success.
    async fn run_counted(&self, range: Range, step: Duration, query: &str) -> Option<Vec<Vec<Sample>>> {
        match self.query_range(range, step, query).await {
            Ok(streams) => {
                self.count(QUERIES_TOTAL, Outcome::Success, query);
                Some(streams)
            }
            Err(err) => {
                error!(query, "failed to execute query: {err}");
                self.count(QUERIES_TOTAL, Outcome::Failed, query);
                None
            }
        }
    }

    async fn query_range(
        &self,
        range: Range,
        step: Duration,
        query: &str,
    ) -> Result<Vec<Vec<Sample>>, Error> {
        let params = serde_qs::to_string(&RangeParams {
            query,
            start: seconds(range.start),
            end: seconds(range.end),
            step: step.as_secs_f64().to_string(),
        })?;
        let base = &self.config.url;
        let mut builder = Uri::builder().path_and_query(format!(
            "{path}{QUERY_RANGE_PATH}?{params}",
            path = base.path().trim_end_matches('/')
        ));
        if let Some(scheme) = base.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = base.authority() {
            builder = builder.authority(authority.clone());
        }

        let request = Request::builder()
            .method(Method::GET)
            .uri(builder.build()?)
            .header(header::USER_AGENT, transport::USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))?;

        let timeout = self.config.timeout;
        let client = self.client.clone();
        tokio::time::timeout(timeout, async move {
            let response = client.oneshot(request).await?;
            let status = response.status();
            let body = response.into_body();
            if !status.is_success() {
                let prefix = transport::read_prefix(body, MAX_ERROR_MESSAGE_BYTES).await?;
                return Err(Error::Status {
                    status,
                    message: transport::first_line(&prefix),
                });
            }
            let body = body.collect().await?.to_bytes();
            decode_matrix(&body)
        })
        .await
        .map_err(|_elapsed| Error::Timeout(timeout))?
    }

    fn count(&self, name: &'static str, outcome: Outcome, query: &str) {
        let labels = Labels::tenant(&self.config.tenant)
            .with_outcome(outcome)
            .with_query(query)
            .build();
        self.counters.increment(name, &labels, 1);
    }
}
