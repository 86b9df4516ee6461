//! This module controls configuration parsing from the end user. The YAML
//! configuration describes every tenant at once; [`Config::tenants`] resolves
//! it into the per-tenant client configurations. Crashes are most likely to
//! originate from this code, intentionally.

use std::{
    fs, io,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use loadgen_series::{Shape, Waveform};
use serde::Deserialize;

use crate::{
    query,
    transport::{self, EndpointError},
    verify, write,
};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// A configured URL is unusable.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// A setting that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// No waveform is configured.
    #[error("At least one waveform must be configured")]
    NoWaveforms,
    /// A waveform is configured more than once.
    #[error("Waveform {0:?} is configured more than once")]
    DuplicateWaveform(Waveform),
    /// Verification is enabled but sine series are not written.
    #[error("Query verification requires the sine waveform")]
    VerificationWithoutSine,
    /// The comparison tolerance is negative or not finite.
    #[error("Comparison tolerance must be a finite, non-negative number, got {0}")]
    Tolerance(f64),
}

fn default_write_interval_millis() -> u64 {
    10_000
}

fn default_write_timeout_millis() -> u64 {
    5_000
}

fn default_write_concurrency() -> usize {
    10
}

fn default_write_batch_size() -> usize {
    1_000
}

fn default_tenants() -> usize {
    1
}

fn default_tenant_id_prefix() -> String {
    String::from("load-generator")
}

fn default_series() -> usize {
    1_000
}

fn default_waveforms() -> Vec<Waveform> {
    vec![Waveform::Sine]
}

fn default_query_interval_millis() -> u64 {
    10_000
}

fn default_query_timeout_millis() -> u64 {
    20_000
}

fn default_query_max_age_millis() -> u64 {
    3_600_000
}

fn default_comparison_tolerance() -> f64 {
    verify::DEFAULT_TOLERANCE
}

/// Default address of the Prometheus exposition endpoint
#[must_use]
pub fn default_prometheus_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9900))
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The remote write endpoint every tenant pushes to
    pub remote_write_url: String,
    /// Time between write ticks, also the spacing of written samples
    #[serde(default = "default_write_interval_millis")]
    pub write_interval_millis: u64,
    /// Deadline of a single remote write request
    #[serde(default = "default_write_timeout_millis")]
    pub write_timeout_millis: u64,
    /// Maximum number of remote write requests in flight per tenant
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    /// Maximum number of series per remote write request
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    /// Number of simulated tenants
    #[serde(default = "default_tenants")]
    pub tenants: usize,
    /// Tenant ids are `<prefix>-<n>`, counting from 1
    #[serde(default = "default_tenant_id_prefix")]
    pub tenant_id_prefix: String,
    /// Number of series per waveform and tenant
    #[serde(default = "default_series")]
    pub series: usize,
    /// Number of `extraLabel<N>` labels on every series
    #[serde(default)]
    pub extra_labels: usize,
    /// Period over which every series is relabelled once. Zero disables
    /// churn.
    #[serde(default)]
    pub series_churn_period_millis: u64,
    /// Waveforms to write
    #[serde(default = "default_waveforms")]
    pub waveforms: Vec<Waveform>,
    /// Read back verification, disabled when absent
    #[serde(default)]
    pub query: Option<Query>,
    /// Address of the Prometheus exposition endpoint
    #[serde(default = "default_prometheus_addr")]
    pub prometheus_addr: SocketAddr,
}

/// Configuration of read back verification
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Query {
    /// Base URL of the Prometheus query API
    pub url: String,
    /// Time between query ticks
    #[serde(default = "default_query_interval_millis")]
    pub interval_millis: u64,
    /// Deadline of a single query
    #[serde(default = "default_query_timeout_millis")]
    pub timeout_millis: u64,
    /// Oldest data a query may reach back to
    #[serde(default = "default_query_max_age_millis")]
    pub max_age_millis: u64,
    /// Relative tolerance when comparing sample values
    #[serde(default = "default_comparison_tolerance")]
    pub comparison_tolerance: f64,
    /// Queries that are run and counted but not compared
    #[serde(default)]
    pub additional_queries: Vec<String>,
}

/// The resolved configuration of a single tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    /// Tenant id
    pub id: String,
    /// Write client configuration
    pub write: write::Config,
    /// Query client configuration, if verification is enabled
    pub query: Option<query::Config>,
}

fn positive_millis(millis: u64, name: &'static str) -> Result<Duration, Error> {
    if millis == 0 {
        return Err(Error::Zero(name));
    }
    Ok(Duration::from_millis(millis))
}

impl Config {
    /// Parse a [`Config`] from YAML.
    ///
    /// # Errors
    ///
    /// Function will error if `contents` is not a valid configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        serde_yaml::from_str(contents).map_err(Error::from)
    }

    /// Validate the configuration and resolve it into one [`Tenant`] per
    /// simulated tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    ///
    /// * An interval, timeout, batch size, concurrency or tenant count is zero
    /// * A URL is not an absolute `http` URL
    /// * Waveforms are empty or repeated
    /// * Verification is enabled without the sine waveform
    /// * The comparison tolerance is negative or not finite
    pub fn tenants(&self) -> Result<Vec<Tenant>, Error> {
        let write_url = transport::parse_endpoint(&self.remote_write_url)?;
        let write_interval = positive_millis(self.write_interval_millis, "write_interval_millis")?;
        let write_timeout = positive_millis(self.write_timeout_millis, "write_timeout_millis")?;
        let concurrency =
            NonZeroUsize::new(self.write_concurrency).ok_or(Error::Zero("write_concurrency"))?;
        let batch_size =
            NonZeroUsize::new(self.write_batch_size).ok_or(Error::Zero("write_batch_size"))?;
        if self.tenants == 0 {
            return Err(Error::Zero("tenants"));
        }

        if self.waveforms.is_empty() {
            return Err(Error::NoWaveforms);
        }
        for (idx, waveform) in self.waveforms.iter().enumerate() {
            if self.waveforms[..idx].contains(waveform) {
                return Err(Error::DuplicateWaveform(*waveform));
            }
        }

        let query = self
            .query
            .as_ref()
            .map(|query| -> Result<_, Error> {
                if !self.waveforms.contains(&Waveform::Sine) {
                    return Err(Error::VerificationWithoutSine);
                }
                if !query.comparison_tolerance.is_finite() || query.comparison_tolerance < 0.0 {
                    return Err(Error::Tolerance(query.comparison_tolerance));
                }
                Ok((
                    transport::parse_endpoint(&query.url)?,
                    positive_millis(query.interval_millis, "query.interval_millis")?,
                    positive_millis(query.timeout_millis, "query.timeout_millis")?,
                    Duration::from_millis(query.max_age_millis),
                    query,
                ))
            })
            .transpose()?;

        let shape = Shape {
            series: self.series,
            extra_labels: self.extra_labels,
            churn_period: Duration::from_millis(self.series_churn_period_millis),
        };

        Ok((1..=self.tenants)
            .map(|n| {
                let id = format!("{prefix}-{n}", prefix = self.tenant_id_prefix);
                let write = write::Config {
                    url: write_url.clone(),
                    tenant: id.clone(),
                    waveforms: self.waveforms.clone(),
                    shape,
                    interval: write_interval,
                    timeout: write_timeout,
                    concurrency,
                    batch_size,
                };
                let query = query.as_ref().map(|(url, interval, timeout, max_age, settings)| query::Config {
                    url: url.clone(),
                    tenant: id.clone(),
                    interval: *interval,
                    timeout: *timeout,
                    max_age: *max_age,
                    expected_series: self.series,
                    write_interval,
                    tolerance: settings.comparison_tolerance,
                    additional_queries: settings.additional_queries.clone(),
                });
                Tenant { id, write, query }
            })
            .collect())
    }
}

/// Load configuration from a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a valid
/// configuration.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    Config::from_yaml(&contents)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const FULL: &str = r#"
remote_write_url: "http://localhost:9009/api/v1/push"
write_interval_millis: 15000
write_timeout_millis: 2000
write_concurrency: 4
write_batch_size: 500
tenants: 3
tenant_id_prefix: "lg"
series: 20
extra_labels: 2
series_churn_period_millis: 60000
waveforms: [sine, sawtooth]
query:
  url: "http://localhost:9009/prometheus"
  interval_millis: 30000
  timeout_millis: 10000
  max_age_millis: 600000
  comparison_tolerance: 0.01
  additional_queries:
    - "up"
prometheus_addr: "127.0.0.1:9090"
"#;

    #[test]
    fn config_deserializes() -> Result<(), Error> {
        let config = Config::from_yaml(FULL)?;
        assert_eq!(
            config,
            Config {
                remote_write_url: String::from("http://localhost:9009/api/v1/push"),
                write_interval_millis: 15_000,
                write_timeout_millis: 2_000,
                write_concurrency: 4,
                write_batch_size: 500,
                tenants: 3,
                tenant_id_prefix: String::from("lg"),
                series: 20,
                extra_labels: 2,
                series_churn_period_millis: 60_000,
                waveforms: vec![Waveform::Sine, Waveform::Sawtooth],
                query: Some(Query {
                    url: String::from("http://localhost:9009/prometheus"),
                    interval_millis: 30_000,
                    timeout_millis: 10_000,
                    max_age_millis: 600_000,
                    comparison_tolerance: 0.01,
                    additional_queries: vec![String::from("up")],
                }),
                prometheus_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            }
        );
        Ok(())
    }

    #[test]
    fn minimal_config_takes_defaults() -> Result<(), Error> {
        let config = Config::from_yaml(r#"remote_write_url: "http://localhost:9009/api/v1/push""#)?;
        assert_eq!(config.write_interval_millis, 10_000);
        assert_eq!(config.write_timeout_millis, 5_000);
        assert_eq!(config.write_concurrency, 10);
        assert_eq!(config.write_batch_size, 1_000);
        assert_eq!(config.tenants, 1);
        assert_eq!(config.tenant_id_prefix, "load-generator");
        assert_eq!(config.series, 1_000);
        assert_eq!(config.extra_labels, 0);
        assert_eq!(config.series_churn_period_millis, 0);
        assert_eq!(config.waveforms, vec![Waveform::Sine]);
        assert_eq!(config.query, None);
        assert_eq!(config.prometheus_addr, default_prometheus_addr());

        let tenants = config.tenants()?;
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].id, "load-generator-1");
        assert!(tenants[0].query.is_none());
        Ok(())
    }

    #[test]
    fn query_defaults_apply() -> Result<(), Error> {
        let config = Config::from_yaml(
            r#"
remote_write_url: "http://localhost:9009/api/v1/push"
query:
  url: "http://localhost:9009/prometheus"
"#,
        )?;
        assert_eq!(
            config.query,
            Some(Query {
                url: String::from("http://localhost:9009/prometheus"),
                interval_millis: 10_000,
                timeout_millis: 20_000,
                max_age_millis: 3_600_000,
                comparison_tolerance: 0.001,
                additional_queries: Vec::new(),
            })
        );
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = Config::from_yaml(
            r#"
remote_write_url: "http://localhost:9009/api/v1/push"
write_intervall_millis: 10
"#,
        );
        assert!(matches!(result, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn tenants_resolve_per_tenant_clients() -> Result<(), Error> {
        let tenants = Config::from_yaml(FULL)?.tenants()?;
        let ids: Vec<&str> = tenants.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["lg-1", "lg-2", "lg-3"]);

        let tenant = &tenants[1];
        assert_eq!(tenant.write.tenant, "lg-2");
        assert_eq!(tenant.write.url, "http://localhost:9009/api/v1/push");
        assert_eq!(tenant.write.interval, Duration::from_secs(15));
        assert_eq!(tenant.write.timeout, Duration::from_secs(2));
        assert_eq!(tenant.write.concurrency.get(), 4);
        assert_eq!(tenant.write.batch_size.get(), 500);
        assert_eq!(
            tenant.write.shape,
            Shape {
                series: 20,
                extra_labels: 2,
                churn_period: Duration::from_secs(60),
            }
        );

        let query = tenant.query.as_ref().expect("verification enabled");
        assert_eq!(query.tenant, "lg-2");
        assert_eq!(query.url, "http://localhost:9009/prometheus");
        assert_eq!(query.interval, Duration::from_secs(30));
        assert_eq!(query.timeout, Duration::from_secs(10));
        assert_eq!(query.max_age, Duration::from_secs(600));
        assert_eq!(query.expected_series, 20);
        assert_eq!(query.write_interval, Duration::from_secs(15));
        assert_eq!(query.additional_queries, vec![String::from("up")]);
        Ok(())
    }

    fn invalid(patch: &str) -> Error {
        let contents = format!("remote_write_url: \"http://localhost:9009/api/v1/push\"\n{patch}");
        Config::from_yaml(&contents)
            .expect("valid yaml")
            .tenants()
            .expect_err("invalid configuration")
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(matches!(invalid("write_interval_millis: 0"), Error::Zero("write_interval_millis")));
        assert!(matches!(invalid("write_timeout_millis: 0"), Error::Zero("write_timeout_millis")));
        assert!(matches!(invalid("write_concurrency: 0"), Error::Zero("write_concurrency")));
        assert!(matches!(invalid("write_batch_size: 0"), Error::Zero("write_batch_size")));
        assert!(matches!(invalid("tenants: 0"), Error::Zero("tenants")));
        assert!(matches!(
            invalid("query:\n  url: \"http://localhost:9009/prometheus\"\n  interval_millis: 0"),
            Error::Zero("query.interval_millis")
        ));
    }

    #[test]
    fn malformed_urls_are_rejected() {
        let result = Config::from_yaml(r#"remote_write_url: "localhost:9009""#)
            .expect("valid yaml")
            .tenants();
        assert!(matches!(result, Err(Error::Endpoint(_))));
        assert!(matches!(
            invalid("query:\n  url: \"https://localhost:9009/prometheus\""),
            Error::Endpoint(EndpointError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn waveforms_are_validated() {
        assert!(matches!(invalid("waveforms: []"), Error::NoWaveforms));
        assert!(matches!(
            invalid("waveforms: [sine, sawtooth, sine]"),
            Error::DuplicateWaveform(Waveform::Sine)
        ));
        assert!(matches!(
            invalid("waveforms: [sawtooth]\nquery:\n  url: \"http://localhost:9009/prometheus\""),
            Error::VerificationWithoutSine
        ));
        assert!(matches!(
            invalid("query:\n  url: \"http://localhost:9009/prometheus\"\n  comparison_tolerance: -0.1"),
            Error::Tolerance(_)
        ));
    }

    #[test]
    fn load_single_file_works() -> Result<(), Box<dyn std::error::Error>> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("loadgen.yaml");
        let mut file = fs::File::create(&config_path)?;
        file.write_all(FULL.as_bytes())?;

        let config = load_config_from_path(&config_path)?;
        assert_eq!(config.tenants, 3);

        let missing = load_config_from_path(&temp_dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(Error::ReadFile { .. })));
        Ok(())
    }
}
