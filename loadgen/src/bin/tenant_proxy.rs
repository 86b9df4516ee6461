//! Reverse proxy stamping a tenant id on every request.

use std::net::SocketAddr;

use clap::Parser;
use http::Uri;
use loadgen::proxy::{self, Proxy};
use tokio::{net::TcpListener, runtime::Builder, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Proxy(#[from] proxy::Error),
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Args {
    /// address to accept requests on
    #[clap(long, default_value = "0.0.0.0:8081")]
    listen: SocketAddr,
    /// base URL of the backend requests are forwarded to
    #[clap(long, default_value = "http://localhost:8080")]
    remote: Uri,
    /// tenant id stamped on every forwarded request
    #[clap(long, default_value = "load-generator-1")]
    tenant: String,
}

async fn inner_main(args: Args) -> Result<(), Error> {
    let proxy = Proxy::new(args.remote, &args.tenant)?;
    let listener = TcpListener::bind(args.listen).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(err) => error!("Could not listen for ctrl-c: {err}"),
        }
        ctrl_c.cancel();
    });

    proxy::serve(listener, proxy, shutdown).await?;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(args))
}
