use std::{
    collections::HashMap,
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ipnet::Ipv4Net;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Value used for cloud credentials that are not present in the environment.
pub const DEFAULT_SENTINEL: &str = "Default";

pub const DEFAULT_CLUSTER_NAME: &str = "k8scluster";
pub const DEFAULT_SUBNET_CIDR: &str = "192.168.3.0/24";
pub const DEFAULT_OVERLAY_CIDR: &str = "10.244.0.0/16";
pub const DEFAULT_MANAGERS: usize = 3;
pub const DEFAULT_WORKERS: usize = 0;
pub const DEFAULT_MANAGER_FLAVOR: u32 = 2004;
pub const DEFAULT_WORKER_FLAVOR: u32 = 2008;
pub const DEFAULT_DNS_SERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
pub const DEFAULT_CLOUD_PROVIDER: &str = "openstack";
pub const DEFAULT_K8S_VERSION: &str = "v1.8.7_coreos.0";
pub const DEFAULT_FLANNEL_VERSION: &str = "v0.8.0";
pub const DEFAULT_AUTH_MODE: &str = "AlwaysAllow";
pub const DEFAULT_DISCOVERY_URL: &str = "https://discovery.etcd.io";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

lazy_static::lazy_static! {
    static ref CLUSTER_NAME: Regex = Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap();
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("managers need to be no less than 3, got {0}")]
    TooFewManagers(usize),
    #[error("subnet {subnet} cannot hold {nodes} nodes starting at host offset {offset}")]
    SubnetExhausted {
        subnet: Ipv4Net,
        nodes: usize,
        offset: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetOverlay {
    #[default]
    Flannel,
    Calico,
}

impl NetOverlay {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetOverlay::Flannel => "flannel",
            NetOverlay::Calico => "calico",
        }
    }
}

impl fmt::Display for NetOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetOverlay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flannel" => Ok(NetOverlay::Flannel),
            "calico" => Ok(NetOverlay::Calico),
            other => Err(ConfigError::Invalid {
                field: "net_overlay",
                reason: format!("unknown overlay {other}, expected flannel or calico"),
            }),
        }
    }
}

/// OpenStack credentials handed to terraform and the cloud provider config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudCredentials {
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub tenant_id: String,
    pub region: String,
    pub auth_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub subnet_cidr: Ipv4Net,
    pub overlay_cidr: Ipv4Net,
    pub managers: usize,
    pub workers: usize,
    pub manager_image_flavor: u32,
    pub worker_image_flavor: u32,
    pub dns_server: Ipv4Addr,
    pub cloud_provider: String,
    pub k8s_version: String,
    pub flannel_version: String,
    pub net_overlay: NetOverlay,
    pub auth_mode: String,
    pub alpha_features: bool,
    pub keypair: String,
    pub floating_ip1: Ipv4Addr,
    pub floating_ip2: Ipv4Addr,
    pub core_password: Option<String>,
    pub cloud: CloudCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub pki_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub url: String,
    pub timeout: Duration,
    pub token: Option<String>,
}

/// Everything a generator run needs, resolved once before the pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub cluster: ClusterConfig,
    pub output: OutputSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    pub name: Option<String>,
    pub subnet_cidr: Option<Ipv4Net>,
    pub overlay_cidr: Option<Ipv4Net>,
    pub managers: Option<usize>,
    pub workers: Option<usize>,
    pub manager_image_flavor: Option<u32>,
    pub worker_image_flavor: Option<u32>,
    pub dns_server: Option<Ipv4Addr>,
    pub cloud_provider: Option<String>,
    pub k8s_version: Option<String>,
    pub flannel_version: Option<String>,
    pub net_overlay: Option<NetOverlay>,
    pub auth_mode: Option<String>,
    pub alpha_features: Option<bool>,
    pub keypair: Option<String>,
    pub floating_ip1: Option<Ipv4Addr>,
    pub floating_ip2: Option<Ipv4Addr>,
    pub core_password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub project_name: Option<String>,
    pub tenant_id: Option<String>,
    pub region: Option<String>,
    pub auth_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSection {
    pub dir: Option<PathBuf>,
    pub pki_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub token: Option<String>,
}

/// One configuration layer. Layers are merged with [`PartialConfig::merge`]
/// and resolved into [`Settings`] once all sources have been applied.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialConfig {
    pub cluster: ClusterSection,
    pub cloud: CloudSection,
    pub output: OutputSection,
    pub discovery: DiscoverySection,
}

macro_rules! overlay {
    ($base:expr, $top:expr; $($field:ident),* $(,)?) => {
        $( $base.$field = $top.$field.or($base.$field); )*
    };
}

impl PartialConfig {
    /// Applies `top` over `self`; any value set in `top` wins.
    pub fn merge(mut self, top: PartialConfig) -> PartialConfig {
        overlay!(self.cluster, top.cluster;
            name, subnet_cidr, overlay_cidr, managers, workers,
            manager_image_flavor, worker_image_flavor, dns_server,
            cloud_provider, k8s_version, flannel_version, net_overlay,
            auth_mode, alpha_features, keypair, floating_ip1, floating_ip2,
            core_password,
        );
        overlay!(self.cloud, top.cloud;
            username, password, project_name, tenant_id, region, auth_url,
        );
        overlay!(self.output, top.output; dir, pki_dir);
        overlay!(self.discovery, top.discovery; url, timeout_secs, token);
        self
    }

    /// Cloud credentials taken from the usual `OS_*` variables.
    pub fn from_env(env: &HashMap<String, String>) -> PartialConfig {
        let var = |k: &str| env.get(k).filter(|v| !v.is_empty()).cloned();
        PartialConfig {
            cloud: CloudSection {
                username: var("OS_USERNAME"),
                password: var("OS_PASSWORD"),
                project_name: var("OS_TENANT_NAME"),
                tenant_id: var("OS_TENANT_ID"),
                region: var("OS_REGION_NAME"),
                auth_url: var("OS_AUTH_URL"),
            },
            ..Default::default()
        }
    }

    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let c = self.cluster;
        let cluster_name = c.name.unwrap_or_else(|| DEFAULT_CLUSTER_NAME.to_owned());
        if !CLUSTER_NAME.is_match(&cluster_name) {
            return Err(ConfigError::Invalid {
                field: "cluster_name",
                reason: format!(
                    "{cluster_name} must be lowercase alphanumerics and dashes"
                ),
            });
        }

        let keypair = c.keypair.ok_or(ConfigError::Missing("keypair"))?;
        if keypair.trim().is_empty() {
            return Err(ConfigError::Missing("keypair"));
        }

        let sentinel = |v: Option<String>| v.unwrap_or_else(|| DEFAULT_SENTINEL.to_owned());
        let cloud = CloudCredentials {
            username: sentinel(self.cloud.username),
            password: sentinel(self.cloud.password),
            project_name: sentinel(self.cloud.project_name),
            tenant_id: sentinel(self.cloud.tenant_id),
            region: sentinel(self.cloud.region),
            auth_url: sentinel(self.cloud.auth_url),
        };

        let cluster = ClusterConfig {
            cluster_name,
            subnet_cidr: c.subnet_cidr.unwrap_or_else(|| default_net(DEFAULT_SUBNET_CIDR)),
            overlay_cidr: c.overlay_cidr.unwrap_or_else(|| default_net(DEFAULT_OVERLAY_CIDR)),
            managers: c.managers.unwrap_or(DEFAULT_MANAGERS),
            workers: c.workers.unwrap_or(DEFAULT_WORKERS),
            manager_image_flavor: c.manager_image_flavor.unwrap_or(DEFAULT_MANAGER_FLAVOR),
            worker_image_flavor: c.worker_image_flavor.unwrap_or(DEFAULT_WORKER_FLAVOR),
            dns_server: c.dns_server.unwrap_or(DEFAULT_DNS_SERVER),
            cloud_provider: c
                .cloud_provider
                .unwrap_or_else(|| DEFAULT_CLOUD_PROVIDER.to_owned()),
            k8s_version: c.k8s_version.unwrap_or_else(|| DEFAULT_K8S_VERSION.to_owned()),
            flannel_version: c
                .flannel_version
                .unwrap_or_else(|| DEFAULT_FLANNEL_VERSION.to_owned()),
            net_overlay: c.net_overlay.unwrap_or_default(),
            auth_mode: c.auth_mode.unwrap_or_else(|| DEFAULT_AUTH_MODE.to_owned()),
            alpha_features: c.alpha_features.unwrap_or(false),
            keypair,
            floating_ip1: c.floating_ip1.ok_or(ConfigError::Missing("floating_ip1"))?,
            floating_ip2: c.floating_ip2.ok_or(ConfigError::Missing("floating_ip2"))?,
            core_password: c.core_password,
            cloud,
        };

        let dir = self.output.dir.unwrap_or_else(|| PathBuf::from("."));
        let pki_dir = self.output.pki_dir.unwrap_or_else(|| dir.join("tls"));

        Ok(Settings {
            cluster,
            output: OutputSettings { dir, pki_dir },
            discovery: DiscoverySettings {
                url: self
                    .discovery
                    .url
                    .unwrap_or_else(|| DEFAULT_DISCOVERY_URL.to_owned()),
                timeout: self
                    .discovery
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT),
                token: self.discovery.token,
            },
        })
    }
}

fn default_net(s: &str) -> Ipv4Net {
    // Constant CIDR literals above always parse.
    s.parse().unwrap()
}

pub fn parse_config(file: &Path) -> Result<PartialConfig, ConfigError> {
    let path = file.display().to_string();
    let config = std::fs::read_to_string(file).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let config: PartialConfig =
        toml::from_str(&config).map_err(|source| ConfigError::Parse { path, source })?;

    info!("config file parsed");
    Ok(config)
}

/// Merges defaults, the optional config file, the environment and CLI flags
/// (lowest to highest precedence) into one immutable [`Settings`].
pub fn load(
    file: Option<&Path>,
    env: &HashMap<String, String>,
    cli: PartialConfig,
) -> Result<Settings, ConfigError> {
    let base = match file {
        Some(f) => parse_config(f)?,
        None => PartialConfig::default(),
    };
    base.merge(PartialConfig::from_env(env)).merge(cli).resolve()
}
