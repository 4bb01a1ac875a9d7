use std::{net::Ipv4Addr, path::PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use common::config::{
    CloudSection, ClusterSection, DiscoverySection, NetOverlay, OutputSection, PartialConfig,
};
use ipnet::Ipv4Net;

#[derive(Debug, Parser)]
#[command(name = "clustergen")]
#[command(author, version, about = "Generates the terraform, cloud-init and PKI artifacts of a Kubernetes cluster", long_about = None)]
pub struct Cli {
    /// Verbose logging
    #[arg(long, short, action = ArgAction::SetTrue, global = true)]
    pub verbose: bool,

    /// Configuration file, overridden by environment and flags
    #[arg(long, short, global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Derive topology, issue certificates and render every cluster artifact
    Generate(GenerateArgs),
    /// Check a persisted PKI directory against its certificate authorities
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Keypair ID
    pub keypair: Option<String>,

    /// Floating IP for API calls
    pub floating_ip1: Option<Ipv4Addr>,

    /// Floating IP for public access to the cluster
    pub floating_ip2: Option<Ipv4Addr>,

    /// Password to authenticate with the core user
    #[arg(long)]
    pub core_password: Option<String>,

    /// OpenStack username (OS_USERNAME)
    #[arg(long)]
    pub username: Option<String>,

    /// OpenStack project name (OS_TENANT_NAME)
    #[arg(long)]
    pub project_name: Option<String>,

    /// Cluster name (k8scluster)
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Private subnet CIDR (192.168.3.0/24)
    #[arg(long)]
    pub subnet_cidr: Option<Ipv4Net>,

    /// Pod overlay CIDR (10.244.0.0/16)
    #[arg(long, alias = "calico-cidr")]
    pub overlay_cidr: Option<Ipv4Net>,

    /// Number of managers, at least 3 (3)
    #[arg(long)]
    pub managers: Option<usize>,

    /// Number of workers (0)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Manager image flavor ID (2004)
    #[arg(long)]
    pub manager_image_flavor: Option<u32>,

    /// Worker image flavor ID (2008)
    #[arg(long)]
    pub worker_image_flavor: Option<u32>,

    /// DNS server (8.8.8.8)
    #[arg(long)]
    pub dns_server: Option<Ipv4Addr>,

    /// Cloud provider support (openstack)
    #[arg(long)]
    pub cloud_provider: Option<String>,

    /// Hyperkube version (v1.8.7_coreos.0)
    #[arg(long)]
    pub k8s_version: Option<String>,

    /// Flannel image version (v0.8.0)
    #[arg(long)]
    pub flannel_version: Option<String>,

    /// Network overlay, flannel or calico (flannel)
    #[arg(long)]
    pub net_overlay: Option<NetOverlay>,

    /// Authorization mode (AlwaysAllow)
    #[arg(long)]
    pub auth_mode: Option<String>,

    /// Enable alpha features (false)
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub alpha_features: Option<bool>,

    /// Directory the cluster artifacts are written to (.)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Directory the key material is written to (<output-dir>/tls)
    #[arg(long)]
    pub pki_dir: Option<PathBuf>,

    /// Discovery service base URL (https://discovery.etcd.io)
    #[arg(long)]
    pub discovery_url: Option<String>,

    /// Discovery request timeout in seconds (10)
    #[arg(long)]
    pub discovery_timeout: Option<u64>,

    /// Use an existing discovery token instead of requesting one
    #[arg(long)]
    pub discovery_token: Option<String>,
}

impl GenerateArgs {
    /// The configuration layer given on the command line.
    pub fn overrides(&self) -> PartialConfig {
        PartialConfig {
            cluster: ClusterSection {
                name: self.cluster_name.clone(),
                subnet_cidr: self.subnet_cidr,
                overlay_cidr: self.overlay_cidr,
                managers: self.managers,
                workers: self.workers,
                manager_image_flavor: self.manager_image_flavor,
                worker_image_flavor: self.worker_image_flavor,
                dns_server: self.dns_server,
                cloud_provider: self.cloud_provider.clone(),
                k8s_version: self.k8s_version.clone(),
                flannel_version: self.flannel_version.clone(),
                net_overlay: self.net_overlay,
                auth_mode: self.auth_mode.clone(),
                alpha_features: self.alpha_features,
                keypair: self.keypair.clone(),
                floating_ip1: self.floating_ip1,
                floating_ip2: self.floating_ip2,
                core_password: self.core_password.clone(),
            },
            cloud: CloudSection {
                username: self.username.clone(),
                project_name: self.project_name.clone(),
                ..Default::default()
            },
            output: OutputSection {
                dir: self.output_dir.clone(),
                pki_dir: self.pki_dir.clone(),
            },
            discovery: DiscoverySection {
                url: self.discovery_url.clone(),
                timeout_secs: self.discovery_timeout,
                token: self.discovery_token.clone(),
            },
        }
    }
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Directory holding the persisted key material
    #[arg(long, default_value = "tls")]
    pub pki_dir: PathBuf,
}
