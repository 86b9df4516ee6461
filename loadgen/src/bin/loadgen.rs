use std::{env, io::Read, net::SocketAddr, sync::Arc};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use loadgen::{
    config::{self, Config},
    counters::{CounterStore, MetricsStore},
    orchestrator::{self, Orchestrator},
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::{
    runtime::Builder,
    signal,
    time::{self, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid loadgen config: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to start loadgen clients: {0}")]
    Orchestrator(#[from] orchestrator::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Exporter(#[from] BuildError),
    #[error("Loadgen clients stopped unexpectedly: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_config_path() -> String {
    "/etc/loadgen/loadgen.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run loadgen with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// address to bind the prometheus exporter to, overrides the
    /// configuration file
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var("LOADGEN_CONFIG") {
        debug!("Using config from env var 'LOADGEN_CONFIG'");
        Ok(env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {}", config_path);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(|err| {
                error!("Could not read config file '{}': {}", config_path, err);
                err
            })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

fn parse_config(contents: &str) -> Result<Config, Error> {
    let config = Config::from_yaml(contents).and_then(|config| {
        config.tenants()?;
        Ok(config)
    });
    config.map_err(|err| {
        error!("Configuration validation failed: {}", err);
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let contents = load_config_contents(config_path)?;
    let config = parse_config(&contents)?;
    info!("Configuration file is valid");
    Ok(config)
}

fn get_config(args: &RunCommand, config: Option<String>) -> Result<Config, Error> {
    let contents = if let Some(config) = config {
        config
    } else {
        load_config_contents(&args.config_path)?
    };

    let mut config = parse_config(&contents)?;
    if let Some(addr) = args.prometheus_addr {
        config.prometheus_addr = addr;
    }
    Ok(config)
}

async fn inner_main(config: Config, shutdown: CancellationToken, max_shutdown_delay: Duration) -> Result<(), Error> {
    PrometheusBuilder::new()
        .with_http_listener(config.prometheus_addr)
        .install()?;
    info!("Serving prometheus metrics on {}", config.prometheus_addr);

    let counters: Arc<dyn CounterStore> = Arc::new(MetricsStore);
    let orchestrator = Orchestrator::new(&config, &counters)?;
    let mut clients = tokio::spawn(orchestrator.run(shutdown.clone()));

    tokio::select! {
        () = shutdown.cancelled() => {
            info!("shutdown signal received.");
        }
        res = &mut clients => {
            res?;
            warn!("All clients exited before shutdown.");
            return Ok(());
        }
    }

    match time::timeout(max_shutdown_delay, clients).await {
        Ok(res) => res?,
        Err(_) => warn!(
            "Clients did not stop within {} seconds.",
            max_shutdown_delay.as_secs()
        ),
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting loadgen {version} run.");

    let args = match Cli::parse().command {
        Commands::Run(args) => args,
        Commands::ConfigCheck(config_check_cmd) => match validate_config(&config_check_cmd.config_path) {
            Ok(_) => std::process::exit(0),
            Err(_) => std::process::exit(1),
        },
    };

    let config = get_config(&args, None)?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(async {
        let shutdown = CancellationToken::new();
        let ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("received ctrl-c"),
                Err(err) => error!("Could not listen for ctrl-c: {err}"),
            }
            ctrl_c.cancel();
        });
        inner_main(config, shutdown, max_shutdown_delay).await
    });
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
remote_write_url: "http://127.0.0.1:1/api/v1/push"
write_timeout_millis: 100
series: 10
query:
  url: "http://127.0.0.1:1/prometheus"
prometheus_addr: "127.0.0.1:0"
"#;

    #[test]
    fn run_command_parses_flags() {
        let cli = Cli::parse_from([
            "loadgen",
            "run",
            "--config-path",
            "/tmp/loadgen.yaml",
            "--prometheus-addr",
            "127.0.0.1:9191",
            "--max-shutdown-delay",
            "5",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.config_path, "/tmp/loadgen.yaml");
        assert_eq!(args.prometheus_addr, Some(SocketAddr::from(([127, 0, 0, 1], 9191))));
        assert_eq!(args.max_shutdown_delay, 5);

        let config = get_config(&args, Some(CONFIG.to_string())).expect("valid config");
        assert_eq!(config.prometheus_addr, SocketAddr::from(([127, 0, 0, 1], 9191)));
    }

    #[test]
    fn config_check_uses_default_path() {
        let cli = Cli::parse_from(["loadgen", "config-check"]);
        let Commands::ConfigCheck(args) = cli.command else {
            panic!("expected config-check command");
        };
        assert_eq!(args.config_path, "/etc/loadgen/loadgen.yaml");
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(matches!(
            parse_config("remote_write_url: \"http://localhost:9009/api/v1/push\"\nwrite_batch_size: 0\n"),
            Err(Error::Config(config::Error::Zero("write_batch_size")))
        ));
        assert!(matches!(parse_config("tenants: [1]"), Err(Error::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inner_main_stops_on_shutdown() {
        let args = Cli::parse_from(["loadgen", "run"]);
        let Commands::Run(args) = args.command else {
            panic!("expected run command");
        };
        let config = get_config(&args, Some(CONFIG.to_string())).expect("valid config");

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let res = time::timeout(
            Duration::from_secs(10),
            inner_main(config, shutdown, Duration::from_secs(5)),
        )
        .await
        .expect("inner_main must return after shutdown");
        assert!(res.is_ok());
    }
}
