//! The remote write client.
//!
//! Every `interval` the client generates the full set of series for the
//! current, interval-aligned timestamp and pushes them to the remote write
//! endpoint in batches. At most `concurrency` batches of one tenant are in
//! flight at once. Failed batches are logged and counted, never retried: the
//! next tick carries fresh data anyway.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    HeaderName, Method, Request, StatusCode, Uri,
    header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT},
};
use http_body_util::Full;
use loadgen_series::{Shape, TimeSeries, Waveform, WriteRequest, align_to_interval, generate_all};
use prost::Message;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};
use tracing::{debug, error, info};

use crate::{
    counters::{CounterStore, Labels, Outcome, WRITE_REQUESTS_TOTAL, WRITE_SERIES_TOTAL},
    identity::{self, TenantLayer},
    run_ticks,
    transport::{self, EndpointError, MAX_ERROR_MESSAGE_BYTES, TenantClient},
};

/// Header announcing the remote write protocol version.
pub const REMOTE_WRITE_VERSION_HEADER: &str = "x-prometheus-remote-write-version";
/// The remote write protocol version spoken.
pub const REMOTE_WRITE_VERSION: &str = "0.1.0";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`WriteClient`]
pub enum Error {
    /// The tenant id is unusable.
    #[error(transparent)]
    Identity(#[from] identity::Error),
    /// The remote write endpoint is unusable.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// Write interval must be positive.
    #[error("Write interval must be positive")]
    ZeroInterval,
    /// Building the request failed.
    #[error("Failed to build write request: {0}")]
    Http(#[from] http::Error),
    /// The request could not be sent.
    #[error("Write request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    /// The error response body could not be read.
    #[error("Failed to read write response: {0}")]
    Body(#[from] hyper::Error),
    /// Snappy compression failed.
    #[error("Failed to compress write request: {0}")]
    Compress(#[from] snap::Error),
    /// The request did not complete within the write timeout.
    #[error("Write request timed out after {0:?}")]
    Timeout(Duration),
    /// The endpoint answered with a non-2xx status.
    #[error("Server returned HTTP status {status}: {message}")]
    Status {
        /// Response status
        status: StatusCode,
        /// First line of the response body
        message: String,
    },
}

/// Configuration of a single tenant's [`WriteClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// The remote write endpoint.
    pub url: Uri,
    /// Tenant id sent with every request.
    pub tenant: String,
    /// Waveforms to generate series for, in order.
    pub waveforms: Vec<Waveform>,
    /// How many series per waveform and how they are labelled.
    pub shape: Shape,
    /// Time between write ticks. Sample timestamps are aligned to it.
    pub interval: Duration,
    /// Deadline of a single batch request, including reading an error body.
    pub timeout: Duration,
    /// Maximum number of batches in flight at once.
    pub concurrency: NonZeroUsize,
    /// Maximum number of series per batch.
    pub batch_size: NonZeroUsize,
}

/// Split `series` into contiguous batches of at most `batch_size`, preserving
/// order.
#[must_use]
pub fn batches(series: Vec<TimeSeries>, batch_size: NonZeroUsize) -> Vec<Vec<TimeSeries>> {
    let batch_size = batch_size.get();
    let mut batches = Vec::with_capacity(series.len().div_ceil(batch_size));
    let mut series = series.into_iter().peekable();
    while series.peek().is_some() {
        batches.push(series.by_ref().take(batch_size).collect());
    }
    batches
}

/// Sends single batches. Shared by every batch task of one client.
#[derive(Debug)]
struct Sender {
    client: TenantClient,
    url: Uri,
    timeout: Duration,
    tenant: String,
    counters: Arc<dyn CounterStore>,
}

impl Sender {
    /// Encode, compress and post `batch`, returning the number of series
    /// written.
    async fn send(&self, batch: Vec<TimeSeries>) -> Result<usize, Error> {
        let series = batch.len();
        let encoded = WriteRequest { timeseries: batch }.encode_to_vec();
        let compressed = snap::raw::Encoder::new().compress_vec(&encoded)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.url.clone())
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(USER_AGENT, transport::USER_AGENT)
            .header(
                HeaderName::from_static(REMOTE_WRITE_VERSION_HEADER),
                REMOTE_WRITE_VERSION,
            )
            .header(CONTENT_LENGTH, compressed.len())
            .body(Full::new(Bytes::from(compressed)))?;

        let timeout = self.timeout;
        let client = self.client.clone();
        tokio::time::timeout(timeout, async move {
            let response = client.oneshot(request).await?;
            let status = response.status();
            if status.is_success() {
                return Ok(series);
            }
            let prefix = transport::read_prefix(response.into_body(), MAX_ERROR_MESSAGE_BYTES).await?;
            Err(Error::Status {
                status,
                message: transport::first_line(&prefix),
            })
        })
        .await
        .map_err(|_elapsed| Error::Timeout(timeout))?
    }

    /// Send `batch` and count the outcome.
    async fn send_counted(&self, batch: Vec<TimeSeries>) {
        let labels = Labels::tenant(&self.tenant);
        match self.send(batch).await {
            Ok(series) => {
                let written = u64::try_from(series).unwrap_or(u64::MAX);
                self.counters.increment(
                    WRITE_REQUESTS_TOTAL,
                    &labels.clone().with_outcome(Outcome::Success).build(),
                    1,
                );
                self.counters
                    .increment(WRITE_SERIES_TOTAL, &labels.build(), written);
            }
            Err(err) => {
                error!("failed to write series to {url}: {err}", url = self.url);
                self.counters.increment(
                    WRITE_REQUESTS_TOTAL,
                    &labels.with_outcome(Outcome::Failed).build(),
                    1,
                );
            }
        }
    }
}

/// Periodically writes a tenant's series to a remote write endpoint.
#[derive(Debug)]
pub struct WriteClient {
    waveforms: Vec<Waveform>,
    shape: Shape,
    interval: Duration,
    batch_size: NonZeroUsize,
    gate: Arc<Semaphore>,
    sender: Arc<Sender>,
}

impl WriteClient {
    /// Create a new [`WriteClient`]
    ///
    /// Every counter the client may increment is registered at zero.
    ///
    /// # Errors
    ///
    /// Function will error if the URL is not an absolute `http` URI, if the
    /// tenant id is not a valid header value or if the interval is zero.
    pub fn new(config: Config, counters: Arc<dyn CounterStore>) -> Result<Self, Error> {
        transport::check_endpoint(&config.url)?;
        if config.interval.is_zero() {
            return Err(Error::ZeroInterval);
        }
        let client = TenantLayer::new(&config.tenant)?.layer(transport::client(config.concurrency.get()));

        let labels = Labels::tenant(&config.tenant);
        for outcome in [Outcome::Success, Outcome::Failed] {
            counters.increment(
                WRITE_REQUESTS_TOTAL,
                &labels.clone().with_outcome(outcome).build(),
                0,
            );
        }
        counters.increment(WRITE_SERIES_TOTAL, &labels.build(), 0);

        Ok(Self {
            waveforms: config.waveforms,
            shape: config.shape,
            interval: config.interval,
            batch_size: config.batch_size,
            gate: Arc::new(Semaphore::new(config.concurrency.get())),
            sender: Arc::new(Sender {
                client,
                url: config.url,
                timeout: config.timeout,
                tenant: config.tenant,
                counters,
            }),
        })
    }

    /// Run the client until `shutdown` is cancelled.
    ///
    /// The first tick fires immediately. Ticks that come due while the
    /// previous one is still running are skipped. Shutdown is only observed
    /// between ticks.
    pub async fn spin(self, shutdown: CancellationToken) {
        run_ticks(self.interval, shutdown, |now| self.write_tick(now)).await;
        info!("shutdown signal received");
    }

    /// Write every series for the tick at `now`, milliseconds since the
    /// epoch, returning once all batches have completed.
    pub async fn write_tick(&self, now: i64) {
        let timestamp = align_to_interval(now, self.interval);
        let series = generate_all(&self.waveforms, timestamp, &self.shape);
        debug!(timestamp, series = series.len(), "writing series");

        let mut tasks = JoinSet::new();
        for batch in batches(series, self.batch_size) {
            // The gate is never closed.
            let Ok(permit) = Arc::clone(&self.gate).acquire_owned().await else {
                break;
            };
            let sender = Arc::clone(&self.sender);
            tasks.spawn(async move {
                sender.send_counted(batch).await;
                drop(permit);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("write batch task failed: {err}");
            }
        }
    }
}
