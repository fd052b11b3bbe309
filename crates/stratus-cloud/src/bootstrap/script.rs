//! Startup script rendering
//!
//! Two scripts are rendered from templates loaded at compile time:
//! - the per-instance bootstrap script (kubeadm init on masters, kubeadm join
//!   on nodes), passed to the provider as user data
//! - the node group startup script, created once per group on providers that
//!   keep reusable scripts (Vultr startup scripts, Linode StackScripts)

use std::collections::BTreeMap;

use minijinja::{context, Environment};
use serde::Serialize;
use stratus_common::resources::{Cluster, Machine, NodeGroup};
use stratus_common::{Error, Result};

use super::JoinToken;

const BOOTSTRAP_TEMPLATE: &str = include_str!("../../templates/bootstrap.sh.j2");
const NODE_GROUP_TEMPLATE: &str = include_str!("../../templates/node-group.sh.j2");

#[derive(Serialize)]
struct ClusterVars<'a> {
    name: &'a str,
    pod_subnet: &'a str,
    service_subnet: &'a str,
    dns_domain: &'a str,
}

impl<'a> From<&'a Cluster> for ClusterVars<'a> {
    fn from(cluster: &'a Cluster) -> Self {
        Self {
            name: cluster.name(),
            pod_subnet: &cluster.spec.network.pod_subnet,
            service_subnet: &cluster.spec.network.service_subnet,
            dns_domain: &cluster.spec.network.dns_domain,
        }
    }
}

#[derive(Serialize)]
struct MachineVars<'a> {
    name: &'a str,
    role: String,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct GroupVars<'a> {
    name: &'a str,
    sku: &'a str,
    spot: bool,
}

/// Renders bootstrap and node group scripts
pub struct ScriptRenderer {
    env: Environment<'static>,
}

impl ScriptRenderer {
    /// Load the built-in templates
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("bootstrap", BOOTSTRAP_TEMPLATE)
            .map_err(|e| Error::template(e.to_string()))?;
        env.add_template("node-group", NODE_GROUP_TEMPLATE)
            .map_err(|e| Error::template(e.to_string()))?;
        Ok(Self { env })
    }

    /// Render the bootstrap script for one machine
    ///
    /// Workers need a join token; masters initialize the control plane and
    /// take none.
    pub fn bootstrap(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        token: Option<&JoinToken>,
        startup_script: Option<&str>,
    ) -> Result<String> {
        let api_endpoint = api_endpoint(cluster).ok_or_else(|| {
            Error::validation_for(
                cluster.name(),
                "cluster has no API endpoint; the load balancer or reserved IP must exist first",
            )
        })?;
        if !machine.is_master() && token.is_none() {
            return Err(Error::internal_with_context(
                "bootstrap",
                format!("worker {} requires a join token", machine.name()),
            ));
        }

        let kubernetes_version = machine
            .spec
            .versions
            .control_plane
            .as_deref()
            .unwrap_or(&machine.spec.versions.kubelet);

        let template = self
            .env
            .get_template("bootstrap")
            .map_err(|e| Error::template(e.to_string()))?;
        template
            .render(context! {
                cluster => ClusterVars::from(cluster),
                machine => MachineVars {
                    name: machine.name(),
                    role: machine.spec.role.to_string(),
                    labels: &machine.spec.labels,
                },
                kubernetes_version => kubernetes_version,
                api_endpoint => api_endpoint,
                token => token.map(|t| t.to_string()),
                cert_sans => cert_sans(cluster),
                startup_script => startup_script,
            })
            .map_err(|e| Error::template(e.to_string()))
    }

    /// Render the shared startup script for a node group
    pub fn node_group(&self, cluster: &Cluster, group: &NodeGroup) -> Result<String> {
        let template = self
            .env
            .get_template("node-group")
            .map_err(|e| Error::template(e.to_string()))?;
        template
            .render(context! {
                cluster => ClusterVars::from(cluster),
                group => GroupVars {
                    name: group.name(),
                    sku: &group.spec.template.sku,
                    spot: group.spec.template.spot,
                },
                kubernetes_version => &cluster.spec.kubernetes_version,
            })
            .map_err(|e| Error::template(e.to_string()))
    }
}

/// `host:port` the API server is reached on
///
/// Load balancer first, then a reserved IP, then any recorded API address.
pub fn api_endpoint(cluster: &Cluster) -> Option<String> {
    let port = cluster.spec.api_server_port;
    if let Some(lb) = &cluster.status.cloud.load_balancer {
        return Some(format!("{}:{}", lb.address, port));
    }
    if let Some(ip) = cluster.status.reserved_ips.first() {
        return Some(format!("{}:{}", ip.ip, port));
    }
    cluster.status.api_addresses.first().map(|a| a.to_string())
}

fn cert_sans(cluster: &Cluster) -> Vec<String> {
    let mut sans: Vec<String> = Vec::new();
    if let Some(lb) = &cluster.status.cloud.load_balancer {
        sans.push(lb.address.clone());
    }
    sans.extend(cluster.status.reserved_ips.iter().map(|r| r.ip.clone()));
    sans.extend(cluster.status.api_addresses.iter().map(|a| a.host.clone()));
    sans.sort();
    sans.dedup();
    sans
}
