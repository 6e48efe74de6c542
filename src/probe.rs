//! Cluster capability detection
//!
//! Runs once at startup before the controller starts. The result is advisory:
//! no reconcile decision depends on it, and a failed lookup only leaves the
//! corresponding capability unknown.

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// API group only served by OpenShift clusters
pub const OPENSHIFT_ROUTE_GROUP: &str = "route.openshift.io";

/// Upper bound for each discovery request
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Capabilities of the cluster the operator runs against
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterCapabilities {
    /// API server git version, if it could be read
    pub server_version: Option<String>,
    /// Whether the OpenShift route API group is served
    pub runs_on_openshift: bool,
}

/// Discovery queries against the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterDiscovery: Send + Sync {
    /// API server version string
    async fn server_version(&self) -> Result<String>;

    /// Names of all served API groups
    async fn api_group_names(&self) -> Result<Vec<String>>;
}

/// Discovery backed by a Kubernetes client
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    /// Create a new KubeDiscovery wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterDiscovery for KubeDiscovery {
    async fn server_version(&self) -> Result<String> {
        let info = tokio::time::timeout(DISCOVERY_TIMEOUT, self.client.apiserver_version())
            .await
            .map_err(|_| Error::internal("timed out reading API server version"))??;
        Ok(info.git_version)
    }

    async fn api_group_names(&self) -> Result<Vec<String>> {
        let groups = tokio::time::timeout(DISCOVERY_TIMEOUT, self.client.list_api_groups())
            .await
            .map_err(|_| Error::internal("timed out listing API groups"))??;
        Ok(groups.groups.into_iter().map(|g| g.name).collect())
    }
}

/// Detect cluster capabilities, logging and tolerating every failure
pub async fn probe(discovery: &dyn ClusterDiscovery) -> ClusterCapabilities {
    let server_version = match discovery.server_version().await {
        Ok(version) => {
            debug!(%version, "detected API server version");
            Some(version)
        }
        Err(e) => {
            warn!(error = %e, "could not read API server version");
            None
        }
    };

    let runs_on_openshift = match discovery.api_group_names().await {
        Ok(groups) => groups.iter().any(|g| g == OPENSHIFT_ROUTE_GROUP),
        Err(e) => {
            warn!(error = %e, "could not list API groups, assuming plain Kubernetes");
            false
        }
    };

    info!(
        server_version = server_version.as_deref().unwrap_or("unknown"),
        runs_on_openshift, "cluster capabilities detected"
    );

    ClusterCapabilities {
        server_version,
        runs_on_openshift,
    }
}
