use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use rcgen::{string::Ia5String, DistinguishedName, DnType, DnValue, SanType};
use topology::{NodeIdentity, Role};

use crate::error::IssuanceError;

/// DNS names the API server answers to from inside the cluster.
pub const APISERVER_DNS_NAMES: &[&str] = &[
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
];

const NODES_GROUP: &str = "system:nodes";
const MASTERS_GROUP: &str = "system:masters";

/// Who a certificate speaks for. The common name and organization follow the
/// conventions the API server authorizer uses to recognise nodes, service
/// accounts and administrators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Authority { name: String },
    /// Node identity towards the API server.
    Node { hostname: String, ip: Ipv4Addr },
    /// Node identity towards its etcd peers.
    EtcdNode { ip: Ipv4Addr },
    ServiceAccount { name: String },
    Client { user: String },
}

impl Subject {
    pub fn common_name(&self) -> String {
        match self {
            Subject::Authority { name } => name.clone(),
            Subject::Node { hostname, .. } => format!("system:node:{hostname}"),
            Subject::EtcdNode { ip } => format!("{ip}-etcd-node"),
            Subject::ServiceAccount { name } => format!("sa:{name}"),
            Subject::Client { user } => user.clone(),
        }
    }

    pub fn organization(&self) -> Option<&'static str> {
        match self {
            Subject::Node { .. } => Some(NODES_GROUP),
            Subject::Client { .. } => Some(MASTERS_GROUP),
            _ => None,
        }
    }

    pub fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(self.common_name()));
        if let Some(o) = self.organization() {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(o.to_owned()));
        }
        dn
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name())?;
        if let Some(o) = self.organization() {
            write!(f, ",O={o}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    Ip(IpAddr),
    Dns(String),
}

impl AltName {
    fn to_san(&self, identity: &str) -> Result<SanType, IssuanceError> {
        match self {
            AltName::Ip(ip) => Ok(SanType::IpAddress(*ip)),
            AltName::Dns(name) => Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|_| IssuanceError::InvalidName {
                    identity: identity.to_owned(),
                    name: name.clone(),
                }),
        }
    }
}

impl From<Ipv4Addr> for AltName {
    fn from(ip: Ipv4Addr) -> Self {
        AltName::Ip(IpAddr::V4(ip))
    }
}

/// What to put in a leaf certificate besides the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRequest {
    pub subject: Subject,
    pub alt_names: Vec<AltName>,
}

impl LeafRequest {
    /// SANs a node certificate carries. Managers also answer on the public
    /// floating address and the internal load balancer; workers only on their
    /// own address.
    pub fn node_alt_names(
        node: &NodeIdentity,
        floating_ip: Ipv4Addr,
        load_balancer: Ipv4Addr,
    ) -> Vec<AltName> {
        match node.role {
            Role::Manager => {
                let mut names: Vec<AltName> = vec![
                    node.ip.into(),
                    floating_ip.into(),
                    load_balancer.into(),
                    Ipv4Addr::LOCALHOST.into(),
                ];
                names.extend(
                    APISERVER_DNS_NAMES
                        .iter()
                        .map(|n| AltName::Dns((*n).to_owned())),
                );
                names
            }
            Role::Worker => vec![node.ip.into()],
        }
    }

    pub fn node(node: &NodeIdentity, floating_ip: Ipv4Addr, load_balancer: Ipv4Addr) -> Self {
        Self {
            subject: Subject::Node {
                hostname: node.hostname.clone(),
                ip: node.ip,
            },
            alt_names: Self::node_alt_names(node, floating_ip, load_balancer),
        }
    }

    pub fn etcd_node(node: &NodeIdentity, floating_ip: Ipv4Addr, load_balancer: Ipv4Addr) -> Self {
        Self {
            subject: Subject::EtcdNode { ip: node.ip },
            alt_names: Self::node_alt_names(node, floating_ip, load_balancer),
        }
    }

    pub fn service_account(name: &str) -> Self {
        Self {
            subject: Subject::ServiceAccount {
                name: name.to_owned(),
            },
            alt_names: vec![Ipv4Addr::LOCALHOST.into()],
        }
    }

    pub fn client(user: &str) -> Self {
        Self {
            subject: Subject::Client {
                user: user.to_owned(),
            },
            alt_names: Vec::new(),
        }
    }

    pub(crate) fn san_types(&self) -> Result<Vec<SanType>, IssuanceError> {
        let identity = self.subject.to_string();
        self.alt_names.iter().map(|a| a.to_san(&identity)).collect()
    }
}
