//! Cluster topology derived from the subnet and the manager/worker counts.
//!
//! Node `k` (zero based, managers first) gets host offset `10 + k` inside the
//! private subnet. The gateway sits at `.1` and the internal load balancer VIP
//! at `.3`. Every rendered document takes its etcd membership from the strings
//! built here, so they always agree.

use std::{fmt, net::Ipv4Addr};

use common::{ClusterConfig, ConfigError};
use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::debug;

pub const MIN_MANAGERS: usize = 3;
pub const NODE_OFFSET: u32 = 10;
pub const GATEWAY_OFFSET: u32 = 1;
pub const LOAD_BALANCER_OFFSET: u32 = 3;
pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manager,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub role: Role,
    /// Position in the node list, managers first.
    pub index: usize,
    pub ip: Ipv4Addr,
    pub hostname: String,
    /// `infra<index>`; only managers are members of the etcd cluster.
    pub etcd_name: String,
}

impl NodeIdentity {
    pub fn is_manager(&self) -> bool {
        self.role == Role::Manager
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub subnet: Ipv4Net,
    pub nodes: Vec<NodeIdentity>,
    pub gateway: Ipv4Addr,
    pub load_balancer: Ipv4Addr,
    /// `https://<ip>:2379` for every manager, comma separated.
    pub etcd_endpoints: String,
    /// `infra<n>=https://<ip>:2380` for every manager, comma separated.
    pub initial_cluster: String,
}

impl Topology {
    pub fn derive(config: &ClusterConfig) -> Result<Self, ConfigError> {
        if config.managers < MIN_MANAGERS {
            return Err(ConfigError::TooFewManagers(config.managers));
        }

        let subnet = config.subnet_cidr.trunc();
        let total = config.managers + config.workers;
        let host_bits = 32 - u32::from(subnet.prefix_len());
        // Offsets must stay below the broadcast address.
        let capacity = if host_bits >= 32 {
            u64::from(u32::MAX)
        } else {
            (1u64 << host_bits) - 1
        };
        if u64::from(NODE_OFFSET) + total as u64 > capacity {
            return Err(ConfigError::SubnetExhausted {
                subnet,
                nodes: total,
                offset: NODE_OFFSET,
            });
        }

        let nodes: Vec<NodeIdentity> = (0..total)
            .map(|index| {
                let role = if index < config.managers {
                    Role::Manager
                } else {
                    Role::Worker
                };
                let offset = NODE_OFFSET + index as u32;
                NodeIdentity {
                    role,
                    index,
                    ip: host(&subnet, offset),
                    // offset, not last octet: subnets wider than /24 wrap it
                    hostname: format!("k8s-{}-node{offset}", config.cluster_name),
                    etcd_name: format!("infra{index}"),
                }
            })
            .collect();

        let managers = nodes.iter().filter(|n| n.is_manager());
        let etcd_endpoints = managers
            .clone()
            .map(|n| format!("https://{}:{}", n.ip, ETCD_CLIENT_PORT))
            .collect::<Vec<_>>()
            .join(",");
        let initial_cluster = managers
            .map(|n| format!("{}=https://{}:{}", n.etcd_name, n.ip, ETCD_PEER_PORT))
            .collect::<Vec<_>>()
            .join(",");

        debug!(nodes = nodes.len(), %subnet, "topology derived");
        Ok(Self {
            subnet,
            gateway: host(&subnet, GATEWAY_OFFSET),
            load_balancer: host(&subnet, LOAD_BALANCER_OFFSET),
            nodes,
            etcd_endpoints,
            initial_cluster,
        })
    }

    pub fn managers(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.nodes.iter().filter(|n| n.role == Role::Manager)
    }

    pub fn workers(&self) -> impl Iterator<Item = &NodeIdentity> {
        self.nodes.iter().filter(|n| n.role == Role::Worker)
    }

    /// First manager, used as the in-cluster master host.
    pub fn master_host(&self) -> Ipv4Addr {
        self.nodes[0].ip
    }
}

fn host(subnet: &Ipv4Net, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + offset)
}
