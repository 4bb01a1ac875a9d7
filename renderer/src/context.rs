//! Parameter sets handed to the templates. Each document gets its own struct;
//! cluster-wide values are computed once in [`ClusterParams`] and borrowed by
//! every per-document set.

use base64::{engine::general_purpose::STANDARD, Engine};
use common::{config::CloudCredentials, ClusterConfig, DiscoveryToken};
use pki::{Certificate, ClusterPki, NodeCertificates, ADMIN_USER, CLUSTER_CA_FILE};
use serde::Serialize;
use topology::{NodeIdentity, Role, Topology};

/// Ports opened to the world on every node: ssh, http and https.
pub const PUBLIC_PORTS: [u16; 3] = [22, 80, 443];

pub fn b64(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

#[derive(Debug, Serialize)]
pub struct ClusterParams<'a> {
    pub cluster_name: &'a str,
    pub cluster_id: &'a str,
    pub discovery_token: &'a str,
    pub subnet_cidr: String,
    pub overlay_cidr: String,
    pub gateway: String,
    pub load_balancer: String,
    pub master_host: String,
    pub managers: usize,
    pub workers: usize,
    pub manager_image_flavor: u32,
    pub worker_image_flavor: u32,
    pub dns_server: String,
    pub floating_ip1: String,
    pub floating_ip2: String,
    pub keypair: &'a str,
    pub cloud_provider: &'a str,
    pub k8s_version: &'a str,
    pub flannel_version: &'a str,
    pub net_overlay: &'static str,
    pub auth_mode: &'a str,
    pub alpha_features: bool,
    pub etcd_endpoints: &'a str,
    pub initial_cluster: &'a str,
}

impl<'a> ClusterParams<'a> {
    pub fn new(config: &'a ClusterConfig, topology: &'a Topology, token: &'a DiscoveryToken) -> Self {
        Self {
            cluster_name: &config.cluster_name,
            cluster_id: token.cluster_id(),
            discovery_token: token.as_str(),
            subnet_cidr: topology.subnet.to_string(),
            overlay_cidr: config.overlay_cidr.to_string(),
            gateway: topology.gateway.to_string(),
            load_balancer: topology.load_balancer.to_string(),
            master_host: topology.master_host().to_string(),
            managers: config.managers,
            workers: config.workers,
            manager_image_flavor: config.manager_image_flavor,
            worker_image_flavor: config.worker_image_flavor,
            dns_server: config.dns_server.to_string(),
            floating_ip1: config.floating_ip1.to_string(),
            floating_ip2: config.floating_ip2.to_string(),
            keypair: &config.keypair,
            cloud_provider: &config.cloud_provider,
            k8s_version: &config.k8s_version,
            flannel_version: &config.flannel_version,
            net_overlay: config.net_overlay.as_str(),
            auth_mode: &config.auth_mode,
            alpha_features: config.alpha_features,
            etcd_endpoints: &topology.etcd_endpoints,
            initial_cluster: &topology.initial_cluster,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CloudConfParams<'a> {
    pub cloud: &'a CloudCredentials,
}

/// One cloud-init document. Only the node, its key material and the role
/// flag differ between nodes.
#[derive(Debug, Serialize)]
pub struct NodeParams<'a> {
    pub cluster: &'a ClusterParams<'a>,
    pub node: &'a NodeIdentity,
    pub is_worker: bool,
    pub core_password: Option<&'a str>,
    pub ca_b64: String,
    pub etcd_ca_b64: String,
    pub k8s_node_b64: String,
    pub k8s_node_key_b64: String,
    pub etcd_node_b64: String,
    pub etcd_node_key_b64: String,
    pub sa_k8s_b64: Option<String>,
    pub sa_k8s_key_b64: Option<String>,
    pub cloud_conf_b64: String,
}

impl<'a> NodeParams<'a> {
    pub fn new(
        cluster: &'a ClusterParams<'a>,
        config: &'a ClusterConfig,
        node: &'a NodeIdentity,
        certs: &NodeCertificates,
        pki: &ClusterPki,
        cloud_conf: &str,
    ) -> Self {
        let service_account: Option<&Certificate> = match node.role {
            Role::Manager => Some(&pki.k8s_service_account),
            Role::Worker => None,
        };
        Self {
            cluster,
            node,
            is_worker: !node.is_manager(),
            core_password: config.core_password.as_deref(),
            ca_b64: b64(pki.cluster_ca.cert_pem()),
            etcd_ca_b64: b64(pki.etcd_ca.cert_pem()),
            k8s_node_b64: b64(&certs.k8s.cert_pem),
            k8s_node_key_b64: b64(&certs.k8s.key_pem),
            etcd_node_b64: b64(&certs.etcd.cert_pem),
            etcd_node_key_b64: b64(&certs.etcd.key_pem),
            sa_k8s_b64: service_account.map(|sa| b64(&sa.cert_pem)),
            sa_k8s_key_b64: service_account.map(|sa| b64(&sa.key_pem)),
            cloud_conf_b64: b64(cloud_conf),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CalicoParams<'a> {
    pub cluster_name: &'a str,
    pub etcd_endpoints: &'a str,
    pub overlay_cidr: &'a str,
    pub etcd_ca_b64: String,
    pub calico_cert_b64: String,
    pub calico_key_b64: String,
}

impl<'a> CalicoParams<'a> {
    pub fn new(cluster: &'a ClusterParams<'a>, pki: &ClusterPki) -> Self {
        Self {
            cluster_name: cluster.cluster_name,
            etcd_endpoints: cluster.etcd_endpoints,
            overlay_cidr: &cluster.overlay_cidr,
            etcd_ca_b64: b64(pki.etcd_ca.cert_pem()),
            calico_cert_b64: b64(&pki.overlay_service_account.cert_pem),
            calico_key_b64: b64(&pki.overlay_service_account.key_pem),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct KubeconfigParams<'a> {
    pub cluster_name: &'a str,
    pub floating_ip1: &'a str,
    pub master_host: &'a str,
    pub pki_dir: &'a str,
    pub ca_file: &'static str,
    pub admin_user: &'static str,
}

impl<'a> KubeconfigParams<'a> {
    pub fn new(cluster: &'a ClusterParams<'a>, pki_dir: &'a str) -> Self {
        Self {
            cluster_name: cluster.cluster_name,
            floating_ip1: &cluster.floating_ip1,
            master_host: &cluster.master_host,
            pki_dir,
            ca_file: CLUSTER_CA_FILE,
            admin_user: ADMIN_USER,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceParams<'a> {
    pub hostname: &'a str,
    pub ip: String,
    pub role: Role,
    pub flavor: u32,
    /// Cloud-init document handed to the instance as user data.
    pub document: String,
}

#[derive(Debug, Serialize)]
pub struct TerraformParams<'a> {
    pub cluster: &'a ClusterParams<'a>,
    pub cloud: &'a CloudCredentials,
    pub public_ports: [u16; 3],
    pub nodes: Vec<InstanceParams<'a>>,
    /// Instance that receives the second floating IP: the first worker, or
    /// the first manager when there are no workers.
    pub ingress_node: &'a str,
}

impl<'a> TerraformParams<'a> {
    pub fn new(cluster: &'a ClusterParams<'a>, config: &'a ClusterConfig, topology: &'a Topology) -> Self {
        let nodes = topology
            .nodes
            .iter()
            .map(|n| InstanceParams {
                hostname: &n.hostname,
                ip: n.ip.to_string(),
                role: n.role,
                flavor: match n.role {
                    Role::Manager => config.manager_image_flavor,
                    Role::Worker => config.worker_image_flavor,
                },
                document: crate::node_document(n),
            })
            .collect();
        let ingress_node = topology
            .workers()
            .next()
            .or_else(|| topology.managers().next())
            .map(|n| n.hostname.as_str())
            .unwrap_or_default();

        Self {
            cluster,
            cloud: &config.cloud,
            public_ports: PUBLIC_PORTS,
            nodes,
            ingress_node,
        }
    }
}
