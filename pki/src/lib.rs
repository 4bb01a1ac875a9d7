//! Cluster PKI.
//!
//! Two independent trust anchors are created per run:
//!
//! ```text
//! k8s-ca ──┬── <ip>-k8s-node      (one per node, system:node identity)
//!          ├── sa-<cluster>-k8s   (control plane service account)
//!          └── admin              (system:masters client)
//!
//! etcd-k8s-ca ──┬── <ip>-etcd-node     (one per node, etcd peer identity)
//!               └── sa-<cluster>-calico (overlay service account, talks to etcd)
//! ```
//!
//! Issuance is all or nothing: [`ClusterPki::issue`] either returns the full
//! hierarchy or the first error.

use std::{collections::BTreeMap, net::Ipv4Addr};

use common::ClusterConfig;
use topology::Topology;
use tracing::info;

mod authority;
mod error;
mod subject;
pub mod verify;

pub use authority::{Certificate, CertificateAuthority, CA_VALIDITY_DAYS, LEAF_VALIDITY_DAYS};
pub use error::{IssuanceError, VerifyError};
pub use subject::{LeafRequest, Subject};

pub const CLUSTER_CA_NAME: &str = "k8s-ca";
pub const ETCD_CA_NAME: &str = "etcd-k8s-ca";
pub const CLUSTER_CA_FILE: &str = "ca.pem";
pub const ETCD_CA_FILE: &str = "etcd-ca.pem";
pub const ADMIN_USER: &str = "admin";
pub const K8S_SERVICE_ACCOUNT: &str = "k8s";
pub const OVERLAY_SERVICE_ACCOUNT: &str = "calico";

/// The two identities every node holds. They never share a key.
#[derive(Debug, Clone)]
pub struct NodeCertificates {
    /// Signed by the cluster CA.
    pub k8s: Certificate,
    /// Signed by the etcd CA.
    pub etcd: Certificate,
}

/// One file of persisted key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiFile {
    pub name: String,
    pub contents: String,
    /// Private keys are written owner-readable only.
    pub secret: bool,
}

#[derive(Debug)]
pub struct ClusterPki {
    pub cluster_ca: CertificateAuthority,
    pub etcd_ca: CertificateAuthority,
    pub nodes: BTreeMap<Ipv4Addr, NodeCertificates>,
    pub k8s_service_account: Certificate,
    pub overlay_service_account: Certificate,
    pub admin: Certificate,
    cluster_name: String,
}

impl ClusterPki {
    pub fn issue(config: &ClusterConfig, topology: &Topology) -> Result<Self, IssuanceError> {
        let cluster_ca = CertificateAuthority::issue(CLUSTER_CA_NAME)?;
        let etcd_ca = CertificateAuthority::issue(ETCD_CA_NAME)?;

        let k8s_service_account =
            cluster_ca.issue_leaf(&LeafRequest::service_account(K8S_SERVICE_ACCOUNT))?;

        let mut nodes = BTreeMap::new();
        for node in &topology.nodes {
            let k8s = cluster_ca.issue_leaf(&LeafRequest::node(
                node,
                config.floating_ip1,
                topology.load_balancer,
            ))?;
            let etcd = etcd_ca.issue_leaf(&LeafRequest::etcd_node(
                node,
                config.floating_ip1,
                topology.load_balancer,
            ))?;
            nodes.insert(node.ip, NodeCertificates { k8s, etcd });
        }

        let admin = cluster_ca.issue_leaf(&LeafRequest::client(ADMIN_USER))?;
        let overlay_service_account =
            etcd_ca.issue_leaf(&LeafRequest::service_account(OVERLAY_SERVICE_ACCOUNT))?;

        info!(
            nodes = nodes.len(),
            cluster_ca = cluster_ca.name(),
            etcd_ca = etcd_ca.name(),
            "cluster pki issued"
        );
        Ok(Self {
            cluster_ca,
            etcd_ca,
            nodes,
            k8s_service_account,
            overlay_service_account,
            admin,
            cluster_name: config.cluster_name.clone(),
        })
    }

    pub fn node(&self, ip: &Ipv4Addr) -> Option<&NodeCertificates> {
        self.nodes.get(ip)
    }

    /// Every certificate and key, named the way they are laid out on disk.
    pub fn files(&self) -> Vec<PkiFile> {
        let mut files = Vec::new();
        let mut pair = |stem: String, cert: &str, key: &str| {
            files.push(PkiFile {
                name: format!("{stem}.pem"),
                contents: cert.to_owned(),
                secret: false,
            });
            files.push(PkiFile {
                name: format!("{stem}-key.pem"),
                contents: key.to_owned(),
                secret: true,
            });
        };

        pair(
            "ca".to_owned(),
            self.cluster_ca.cert_pem(),
            self.cluster_ca.key_pem(),
        );
        pair(
            "etcd-ca".to_owned(),
            self.etcd_ca.cert_pem(),
            self.etcd_ca.key_pem(),
        );
        for (ip, node) in &self.nodes {
            pair(format!("{ip}-k8s-node"), &node.k8s.cert_pem, &node.k8s.key_pem);
            pair(format!("{ip}-etcd-node"), &node.etcd.cert_pem, &node.etcd.key_pem);
        }
        pair(
            format!("sa-{}-{K8S_SERVICE_ACCOUNT}", self.cluster_name),
            &self.k8s_service_account.cert_pem,
            &self.k8s_service_account.key_pem,
        );
        pair(
            format!("sa-{}-{OVERLAY_SERVICE_ACCOUNT}", self.cluster_name),
            &self.overlay_service_account.cert_pem,
            &self.overlay_service_account.key_pem,
        );
        pair(
            ADMIN_USER.to_owned(),
            &self.admin.cert_pem,
            &self.admin.key_pem,
        );
        files
    }
}
