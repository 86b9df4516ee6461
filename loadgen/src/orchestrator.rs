//! Per-tenant client orchestration.
//!
//! Each simulated tenant owns one write client and, when verification is
//! enabled, one query client. Tenants share nothing but the counter store.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::{
    config::{self, Config},
    counters::CounterStore,
    query::{self, QueryClient},
    write::{self, WriteClient},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Orchestrator`]
pub enum Error {
    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    /// A write client could not be created.
    #[error("Failed to create write client for tenant {tenant}: {source}")]
    Write {
        /// Tenant id
        tenant: String,
        /// Underlying error
        #[source]
        source: write::Error,
    },
    /// A query client could not be created.
    #[error("Failed to create query client for tenant {tenant}: {source}")]
    Query {
        /// Tenant id
        tenant: String,
        /// Underlying error
        #[source]
        source: query::Error,
    },
}

/// The clients of one tenant.
#[derive(Debug)]
pub struct TenantClients {
    /// Tenant id
    pub id: String,
    /// Writes the tenant's series
    pub write: WriteClient,
    /// Verifies the tenant's series, if enabled
    pub query: Option<QueryClient>,
}

/// Runs the clients of every tenant.
#[derive(Debug)]
pub struct Orchestrator {
    tenants: Vec<TenantClients>,
}

impl Orchestrator {
    /// Create a new [`Orchestrator`] with the clients of every tenant in
    /// `config`.
    ///
    /// # Errors
    ///
    /// Function will error if the configuration is invalid or any client
    /// cannot be created.
    pub fn new(config: &Config, counters: &Arc<dyn CounterStore>) -> Result<Self, Error> {
        let tenants = config
            .tenants()?
            .into_iter()
            .map(|tenant| {
                let write = WriteClient::new(tenant.write, Arc::clone(counters)).map_err(|source| {
                    Error::Write {
                        tenant: tenant.id.clone(),
                        source,
                    }
                })?;
                let query = tenant
                    .query
                    .map(|query| QueryClient::new(query, Arc::clone(counters)))
                    .transpose()
                    .map_err(|source| Error::Query {
                        tenant: tenant.id.clone(),
                        source,
                    })?;
                Ok(TenantClients {
                    id: tenant.id,
                    write,
                    query,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self { tenants })
    }

    /// The clients of every tenant, in tenant order.
    #[must_use]
    pub fn tenants(&self) -> &[TenantClients] {
        &self.tenants
    }

    /// Run every client until `shutdown` is cancelled, returning once all of
    /// them have exited.
    pub async fn run(self, shutdown: CancellationToken) {
        let tenants = self.tenants.len();
        let mut clients = JoinSet::new();
        for tenant in self.tenants {
            let span = info_span!("tenant", id = %tenant.id);
            clients.spawn(tenant.write.spin(shutdown.clone()).instrument(span.clone()));
            if let Some(query) = tenant.query {
                clients.spawn(query.spin(shutdown.clone()).instrument(span));
            }
        }
        info!("started {} clients for {tenants} tenants", clients.len());

        while let Some(res) = clients.join_next().await {
            if let Err(err) = res {
                error!("Could not join the spawned client task: {err}");
            }
        }
    }
}
