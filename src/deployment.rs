//! Deployment adapter surface: the capability contract the scheduler drives,
//! plus the pure per-component cluster layout and registry naming rules.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EnvType;
use crate::error::Result;

/// Bound implementations must apply to each individual cloud call.
pub const ECS_WAIT_TIME: Duration = Duration::from_secs(30);

/// A deployable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Ceramic,
    Ipfs,
    Cas,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Ceramic => "ceramic",
            Component::Ipfs => "ipfs",
            Component::Cas => "cas",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One atomic deployment topology: cluster -> service -> task definition.
///
/// `generate_env_layout` leaves every task definition `None`; `update_env`
/// fills them in as services are updated, and `check_env` probes whatever the
/// layout records (a `None` descriptor probes the service's current
/// deployment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvLayout {
    /// Image repository URI for the component this layout deploys.
    pub repo: String,
    pub clusters: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

#[async_trait]
pub trait Deployment: Send + Sync {
    /// Run one task using the service's network configuration; returns the
    /// task id.
    async fn launch_service(
        &self,
        cluster: &str,
        service: &str,
        family: &str,
        container: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<String>;

    /// Run one task using VPC configuration fetched from a parameter-store
    /// entry; returns the task id.
    async fn launch_task(
        &self,
        cluster: &str,
        family: &str,
        container: &str,
        vpc_config_param: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<String>;

    /// True iff every listed task's last status matches the desired status
    /// (running when `running`, stopped otherwise).
    async fn check_task(&self, running: bool, cluster: &str, task_ids: &[String]) -> Result<bool>;

    /// Register a task definition cloned from the service's current one with
    /// the image replaced, point the service at it, and return its id.
    async fn update_service(&self, cluster: &str, service: &str, image: &str) -> Result<String>;

    /// With `Some(task_def)`, true iff a deployment of that task definition
    /// has running tasks; with `None`, true iff the service's current
    /// deployment does.
    async fn check_service(
        &self,
        cluster: &str,
        service: &str,
        task_def: Option<&str>,
    ) -> Result<bool>;

    fn generate_env_layout(&self, component: Component) -> Result<EnvLayout>;

    fn registry_uri(&self, component: Component) -> Result<String>;

    /// Apply the layout as a unit, recording each new task definition.
    async fn update_env(&self, layout: &mut EnvLayout, tag: &str) -> Result<()> {
        let image = format!("{}:{}", layout.repo, tag);
        for (cluster, services) in layout.clusters.iter_mut() {
            for (service, task_def) in services.iter_mut() {
                *task_def = Some(self.update_service(cluster, service, &image).await?);
            }
        }
        Ok(())
    }

    /// Probe the layout as a unit.
    async fn check_env(&self, layout: &EnvLayout) -> Result<bool> {
        for (cluster, services) in layout.clusters.iter() {
            for (service, task_def) in services.iter() {
                if !self
                    .check_service(cluster, service, task_def.as_deref())
                    .await?
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

const GLOBAL_PREFIX: &str = "ceramic";

const SUFFIX_CERAMIC_NODE: &str = "node";
const SUFFIX_CERAMIC_GATEWAY: &str = "gateway";
const SUFFIX_IPFS_NODE: &str = "ipfs-nd";
const SUFFIX_IPFS_GATEWAY: &str = "ipfs-gw";
const SUFFIX_CAS_API: &str = "api";
const SUFFIX_CAS_ANCHOR: &str = "anchor";
const SUFFIX_ELP11_CERAMIC_NODE: &str = "elp-1-1-node";
const SUFFIX_ELP12_CERAMIC_NODE: &str = "elp-1-2-node";
const SUFFIX_ELP11_IPFS_NODE: &str = "elp-1-1-ipfs-nd";
const SUFFIX_ELP12_IPFS_NODE: &str = "elp-1-2-ipfs-nd";

/// Private cluster name for an environment.
pub fn private_cluster(env: EnvType) -> String {
    format!("{GLOBAL_PREFIX}-{env}")
}

/// Public (external) cluster name for an environment.
pub fn public_cluster(env: EnvType) -> String {
    format!("{GLOBAL_PREFIX}-{env}-ex")
}

/// CAS cluster name for an environment.
pub fn cas_cluster(env: EnvType) -> String {
    format!("{GLOBAL_PREFIX}-{env}-cas")
}

/// The cluster -> service topology a component deploys to, with empty task
/// definitions. Prod carries the two additional ELP nodes in the public
/// cluster.
pub fn cluster_layout(
    env: EnvType,
    component: Component,
) -> BTreeMap<String, BTreeMap<String, Option<String>>> {
    let private = private_cluster(env);
    let public = public_cluster(env);
    let cas = cas_cluster(env);

    let mut clusters = BTreeMap::new();
    match component {
        Component::Ceramic => {
            clusters.insert(
                private.clone(),
                services([format!("{private}-{SUFFIX_CERAMIC_NODE}")]),
            );
            let mut public_services = services([
                format!("{public}-{SUFFIX_CERAMIC_NODE}"),
                format!("{public}-{SUFFIX_CERAMIC_GATEWAY}"),
            ]);
            if env == EnvType::Prod {
                public_services.insert(format!("{GLOBAL_PREFIX}-{SUFFIX_ELP11_CERAMIC_NODE}"), None);
                public_services.insert(format!("{GLOBAL_PREFIX}-{SUFFIX_ELP12_CERAMIC_NODE}"), None);
            }
            clusters.insert(public, public_services);
            clusters.insert(cas.clone(), services([format!("{cas}-{SUFFIX_CERAMIC_NODE}")]));
        }
        Component::Ipfs => {
            clusters.insert(
                private.clone(),
                services([format!("{private}-{SUFFIX_IPFS_NODE}")]),
            );
            let mut public_services = services([
                format!("{public}-{SUFFIX_IPFS_NODE}"),
                format!("{public}-{SUFFIX_IPFS_GATEWAY}"),
            ]);
            if env == EnvType::Prod {
                public_services.insert(format!("{GLOBAL_PREFIX}-{SUFFIX_ELP11_IPFS_NODE}"), None);
                public_services.insert(format!("{GLOBAL_PREFIX}-{SUFFIX_ELP12_IPFS_NODE}"), None);
            }
            clusters.insert(public, public_services);
            clusters.insert(cas.clone(), services([format!("{cas}-{SUFFIX_IPFS_NODE}")]));
        }
        Component::Cas => {
            clusters.insert(
                cas.clone(),
                services([
                    format!("{cas}-{SUFFIX_CAS_API}"),
                    format!("{cas}-{SUFFIX_CAS_ANCHOR}"),
                ]),
            );
        }
    }
    clusters
}

fn services<const N: usize>(names: [String; N]) -> BTreeMap<String, Option<String>> {
    names.into_iter().map(|name| (name, None)).collect()
}

/// ECR repository URI for a component image.
pub fn registry_uri(account_id: &str, region: &str, env: EnvType, component: Component) -> String {
    let repo = match component {
        Component::Ceramic => format!("ceramic-{env}"),
        Component::Ipfs => format!("go-ipfs-{env}"),
        Component::Cas => format!("ceramic-{env}-cas"),
    };
    format!("{account_id}.dkr.ecr.{region}.amazonaws.com/{repo}")
}
