//! Artifact Renderer.
//!
//! Binds topology, issued key material and configuration into the fixed set
//! of cluster documents. Rendering is pure: identical inputs give
//! byte-identical documents, and nothing touches the filesystem.

use std::net::Ipv4Addr;

use common::{ClusterConfig, DiscoveryToken};
use minijinja::{Environment, UndefinedBehavior};
use pki::ClusterPki;
use serde::Serialize;
use thiserror::Error;
use topology::{NodeIdentity, Topology};
use tracing::{debug, info};

pub mod context;

/// Embedded templates. Each template name doubles as the name of the
/// document it renders, except for the per-node cloud-init documents.
pub mod templates {
    macros::include_templates!();
}

use context::{
    CalicoParams, CloudConfParams, ClusterParams, KubeconfigParams, NodeParams, TerraformParams,
};

/// Relative location of the key material as seen from the output directory.
pub const DEFAULT_PKI_DIR: &str = "tls";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template {template} could not be loaded: {source}")]
    Template {
        template: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("rendering {document} failed: {source}")]
    Render {
        document: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("{document} is not a valid cluster definition: {source}")]
    Definition {
        document: String,
        #[source]
        source: hcl::Error,
    },
    #[error("no certificates were issued for node {0}")]
    MissingCertificates(Ipv4Addr),
}

/// A named output document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub name: String,
    pub contents: String,
    /// Holds cloud credentials in plain text.
    pub secret: bool,
}

pub fn node_document(node: &NodeIdentity) -> String {
    format!("node_{}.yaml", node.ip)
}

pub struct Renderer {
    env: Environment<'static>,
    pki_dir: String,
}

impl Renderer {
    pub fn new() -> Result<Self, RenderError> {
        Self::with_pki_dir(DEFAULT_PKI_DIR)
    }

    /// `pki_dir` is written into the kubeconfig script, so it should be
    /// relative to where the script is run from.
    pub fn with_pki_dir(pki_dir: impl Into<String>) -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);

        for &(name, source) in templates::TEMPLATES {
            env.add_template(name, source)
                .map_err(|source| RenderError::Template {
                    template: name.to_string(),
                    source,
                })?;
        }

        Ok(Self {
            env,
            pki_dir: pki_dir.into(),
        })
    }

    fn render<S: Serialize>(
        &self,
        template: &str,
        document: String,
        ctx: S,
    ) -> Result<RenderedArtifact, RenderError> {
        let tmpl = self
            .env
            .get_template(template)
            .map_err(|source| RenderError::Template {
                template: template.to_owned(),
                source,
            })?;
        let contents = tmpl.render(ctx).map_err(|source| RenderError::Render {
            document: document.clone(),
            source,
        })?;

        debug!(%document, bytes = contents.len(), "rendered");
        Ok(RenderedArtifact {
            secret: document == templates::CLOUD_CONF,
            name: document,
            contents,
        })
    }

    /// Renders every cluster document. The order is fixed: cloud provider
    /// config, one cloud-init document per node, overlay manifest, kubeconfig
    /// script, cluster definition and finally the status summary.
    pub fn render_all(
        &self,
        config: &ClusterConfig,
        topology: &Topology,
        pki: &ClusterPki,
        token: &DiscoveryToken,
    ) -> Result<Vec<RenderedArtifact>, RenderError> {
        let cluster = ClusterParams::new(config, topology, token);
        let mut artifacts = Vec::with_capacity(topology.nodes.len() + 5);

        let cloud_conf = self.render(
            templates::CLOUD_CONF,
            templates::CLOUD_CONF.to_owned(),
            CloudConfParams {
                cloud: &config.cloud,
            },
        )?;

        for node in &topology.nodes {
            let certs = pki
                .node(&node.ip)
                .ok_or(RenderError::MissingCertificates(node.ip))?;
            let params = NodeParams::new(&cluster, config, node, certs, pki, &cloud_conf.contents);
            artifacts.push(self.render(
                templates::CLOUD_INIT_YAML,
                node_document(node),
                params,
            )?);
        }
        artifacts.insert(0, cloud_conf);

        artifacts.push(self.render(
            templates::CALICO_YAML,
            templates::CALICO_YAML.to_owned(),
            CalicoParams::new(&cluster, pki),
        )?);
        artifacts.push(self.render(
            templates::KUBECONFIG_SH,
            templates::KUBECONFIG_SH.to_owned(),
            KubeconfigParams::new(&cluster, &self.pki_dir),
        )?);

        let definition = self.render(
            templates::K8S_TF,
            templates::K8S_TF.to_owned(),
            TerraformParams::new(&cluster, config, topology),
        )?;
        hcl::parse(&definition.contents).map_err(|source| RenderError::Definition {
            document: definition.name.clone(),
            source,
        })?;
        artifacts.push(definition);

        artifacts.push(self.render(
            templates::CLUSTER_STATUS,
            templates::CLUSTER_STATUS.to_owned(),
            &cluster,
        )?);

        info!(documents = artifacts.len(), "cluster artifacts rendered");
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use base64::{engine::general_purpose::STANDARD, Engine};
    use common::config::{CloudCredentials, NetOverlay};
    use serde::Deserialize;

    use super::*;

    const TOKEN: &str = "https://discovery.etcd.io/6a28e078895c5ec737174db2419bb2f3";

    fn config(managers: usize, workers: usize) -> ClusterConfig {
        ClusterConfig {
            cluster_name: "prod".to_owned(),
            subnet_cidr: "192.168.3.0/24".parse().unwrap(),
            overlay_cidr: "10.244.0.0/16".parse().unwrap(),
            managers,
            workers,
            manager_image_flavor: 2004,
            worker_image_flavor: 2008,
            dns_server: Ipv4Addr::new(8, 8, 8, 8),
            cloud_provider: "openstack".to_owned(),
            k8s_version: "v1.8.7_coreos.0".to_owned(),
            flannel_version: "v0.8.0".to_owned(),
            net_overlay: NetOverlay::Flannel,
            auth_mode: "RBAC".to_owned(),
            alpha_features: true,
            keypair: "ops".to_owned(),
            floating_ip1: Ipv4Addr::new(203, 0, 113, 10),
            floating_ip2: Ipv4Addr::new(203, 0, 113, 11),
            core_password: Some("s3cret".to_owned()),
            cloud: CloudCredentials {
                username: "alice".to_owned(),
                password: "hunter2".to_owned(),
                project_name: "k8s".to_owned(),
                tenant_id: "0123456789abcdef".to_owned(),
                region: "ams".to_owned(),
                auth_url: "https://keystone.example:5000/v3".to_owned(),
            },
        }
    }

    struct Fixture {
        config: ClusterConfig,
        topology: Topology,
        pki: ClusterPki,
        token: DiscoveryToken,
    }

    impl Fixture {
        fn new(managers: usize, workers: usize) -> Self {
            let config = config(managers, workers);
            let topology = Topology::derive(&config).unwrap();
            let pki = ClusterPki::issue(&config, &topology).unwrap();
            Self {
                config,
                topology,
                pki,
                token: DiscoveryToken::new(TOKEN),
            }
        }

        fn render(&self) -> HashMap<String, String> {
            Renderer::new()
                .unwrap()
                .render_all(&self.config, &self.topology, &self.pki, &self.token)
                .unwrap()
                .into_iter()
                .map(|a| (a.name, a.contents))
                .collect()
        }
    }

    fn written_file(doc: &str, path: &str) -> String {
        let yaml: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
        let entry = yaml["write_files"]
            .as_sequence()
            .unwrap()
            .iter()
            .find(|f| f["path"].as_str() == Some(path))
            .unwrap_or_else(|| panic!("{path} not written"));
        let content = entry["content"].as_str().unwrap();
        if entry["encoding"].as_str() == Some("b64") {
            String::from_utf8(STANDARD.decode(content.trim()).unwrap()).unwrap()
        } else {
            content.to_owned()
        }
    }

    fn env_value(doc: &str, key: &str) -> String {
        let env = written_file(doc, "/etc/kubernetes/cluster.env");
        env.lines()
            .find_map(|l| l.strip_prefix(&format!("{key}=")))
            .unwrap_or_else(|| panic!("{key} missing"))
            .to_owned()
    }

    #[test]
    fn renders_every_document_in_order() {
        let f = Fixture::new(3, 1);
        let names: Vec<String> = Renderer::new()
            .unwrap()
            .render_all(&f.config, &f.topology, &f.pki, &f.token)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(
            names,
            [
                "cloud.conf",
                "node_192.168.3.10.yaml",
                "node_192.168.3.11.yaml",
                "node_192.168.3.12.yaml",
                "node_192.168.3.13.yaml",
                "calico.yaml",
                "kubeconfig.sh",
                "k8s.tf",
                "cluster.status",
            ]
        );
    }

    #[test]
    fn only_the_cloud_config_is_secret() {
        let f = Fixture::new(3, 1);
        let artifacts = Renderer::new()
            .unwrap()
            .render_all(&f.config, &f.topology, &f.pki, &f.token)
            .unwrap();
        let secret: Vec<&str> = artifacts
            .iter()
            .filter(|a| a.secret)
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(secret, [templates::CLOUD_CONF]);
    }

    #[test]
    fn rendering_is_deterministic() {
        let f = Fixture::new(3, 2);
        assert_eq!(f.render(), f.render());
    }

    #[test]
    fn every_document_agrees_on_etcd_membership() {
        let f = Fixture::new(4, 2);
        let docs = f.render();
        let endpoints = &f.topology.etcd_endpoints;
        let peers = &f.topology.initial_cluster;

        for node in &f.topology.nodes {
            let doc = &docs[&node_document(node)];
            assert_eq!(&env_value(doc, "ETCD_ENDPOINTS"), endpoints);
            assert_eq!(&env_value(doc, "ETCD_INITIAL_CLUSTER"), peers);
            assert_eq!(env_value(doc, "DISCOVERY_URL"), TOKEN);
        }

        let tf = &docs["k8s.tf"];
        assert!(tf.contains(&format!("etcd_endpoints       = \"{endpoints}\"")));
        assert!(tf.contains(&format!("etcd_initial_cluster = \"{peers}\"")));
        assert!(docs["calico.yaml"].contains(&format!("etcd_endpoints: \"{endpoints}\"")));
        assert!(docs["cluster.status"].contains(&format!("Etcd peers:\t{peers}\n")));
    }

    #[test]
    fn cluster_wide_values_are_identical_across_nodes() {
        let f = Fixture::new(3, 2);
        let docs = f.render();
        let cluster_wide = |doc: &str| -> Vec<String> {
            written_file(doc, "/etc/kubernetes/cluster.env")
                .lines()
                .filter(|l| {
                    !l.starts_with("NODE_") && !l.starts_with("API_SERVER=")
                })
                .map(str::to_owned)
                .collect()
        };
        let first = cluster_wide(&docs["node_192.168.3.10.yaml"]);
        assert!(first.contains(&"OVERLAY_CIDR=10.244.0.0/16".to_owned()));
        for node in &f.topology.nodes {
            assert_eq!(cluster_wide(&docs[&node_document(node)]), first);
        }
    }

    #[test]
    fn node_documents_embed_their_own_material() {
        let f = Fixture::new(3, 1);
        let docs = f.render();
        for node in &f.topology.nodes {
            let doc = &docs[&node_document(node)];
            let certs = f.pki.node(&node.ip).unwrap();
            assert_eq!(written_file(doc, "/etc/kubernetes/ssl/node.pem"), certs.k8s.cert_pem);
            assert_eq!(written_file(doc, "/etc/kubernetes/ssl/node-key.pem"), certs.k8s.key_pem);
            assert_eq!(written_file(doc, "/etc/kubernetes/ssl/etcd-node.pem"), certs.etcd.cert_pem);
            assert_eq!(written_file(doc, "/etc/kubernetes/ssl/ca.pem"), f.pki.cluster_ca.cert_pem());
            assert_eq!(written_file(doc, "/etc/kubernetes/ssl/etcd-ca.pem"), f.pki.etcd_ca.cert_pem());
            assert_eq!(written_file(doc, "/etc/kubernetes/cloud.conf"), docs["cloud.conf"]);
        }
    }

    fn written_paths(doc: &str) -> Vec<String> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
        yaml["write_files"]
            .as_sequence()
            .unwrap()
            .iter()
            .filter_map(|f| f["path"].as_str().map(str::to_owned))
            .collect()
    }

    /// Paths given to `*_FILE=` variables and `--*file=` flags.
    fn referenced_files(doc: &str) -> Vec<String> {
        doc.lines()
            .flat_map(|line| {
                ["FILE=", "file="]
                    .into_iter()
                    .filter_map(move |marker| line.find(marker).map(|at| &line[at + marker.len()..]))
            })
            .map(|rest| {
                rest.split(|c: char| c == '"' || c.is_whitespace())
                    .next()
                    .unwrap_or_default()
                    .to_owned()
            })
            .filter(|path| path.starts_with('/'))
            .collect()
    }

    #[test]
    fn referenced_key_material_is_installed() {
        let f = Fixture::new(3, 1);
        let docs = f.render();
        for node in &f.topology.nodes {
            let doc = &docs[&node_document(node)];
            let written = written_paths(doc);
            let referenced = referenced_files(doc);
            assert!(!referenced.is_empty());
            let missing: Vec<&String> = referenced.iter().filter(|p| !written.contains(*p)).collect();
            assert!(missing.is_empty(), "{}: {missing:?}", node.ip);
        }

        let manager = &docs["node_192.168.3.10.yaml"];
        assert!(referenced_files(manager).contains(&"/etc/kubernetes/ssl/etcd-node-key.pem".to_owned()));
    }

    #[test]
    fn etcd_bootstraps_through_discovery_only() {
        let f = Fixture::new(3, 0);
        let docs = f.render();
        for node in &f.topology.nodes {
            let doc = &docs[&node_document(node)];
            assert!(doc.contains(&format!("Environment=\"ETCD_DISCOVERY={TOKEN}\"")));
            assert!(!doc.contains("Environment=\"ETCD_INITIAL_CLUSTER"));
            assert_eq!(&env_value(doc, "ETCD_INITIAL_CLUSTER"), &f.topology.initial_cluster);
        }
    }

    #[test]
    fn managers_carry_service_account_and_workers_the_vip() {
        let f = Fixture::new(3, 1);
        let docs = f.render();

        let manager = &docs["node_192.168.3.10.yaml"];
        assert_eq!(
            written_file(manager, "/etc/kubernetes/ssl/sa-k8s-key.pem"),
            f.pki.k8s_service_account.key_pem
        );
        assert!(manager.contains("ETCD_NAME=infra0"));
        assert!(manager.contains("--feature-gates=AllAlpha=true"));
        assert_eq!(env_value(manager, "ALPHA_FEATURES"), "true");

        let worker = &docs["node_192.168.3.13.yaml"];
        assert!(!worker.contains("sa-k8s"));
        assert!(!worker.contains("etcd-member.service"));
        assert_eq!(env_value(worker, "API_SERVER"), "https://192.168.3.3");
        assert_eq!(env_value(worker, "NODE_ROLE"), "worker");
    }

    #[test]
    fn yaml_documents_parse() {
        let f = Fixture::new(3, 2);
        let docs = f.render();
        for node in &f.topology.nodes {
            let doc: serde_yaml::Value = serde_yaml::from_str(&docs[&node_document(node)]).unwrap();
            assert_eq!(doc["hostname"].as_str(), Some(node.hostname.as_str()));
        }

        let calico: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&docs["calico.yaml"])
            .map(|d| serde_yaml::Value::deserialize(d).unwrap())
            .collect();
        assert_eq!(calico.len(), 3);
        let secret = calico[1]["data"]["etcd-key"].as_str().unwrap();
        let key = String::from_utf8(STANDARD.decode(secret).unwrap()).unwrap();
        assert_eq!(key, f.pki.overlay_service_account.key_pem);
    }

    #[test]
    fn cluster_definition_is_valid_hcl() {
        let f = Fixture::new(3, 2);
        let tf = &f.render()["k8s.tf"];
        assert!(hcl::parse(tf).is_ok());
        assert_eq!(
            tf.matches("resource \"openstack_compute_instance_v2\"").count(),
            5
        );
        assert!(tf.contains("user_data       = file(\"node_192.168.3.14.yaml\")"));
        assert!(tf.contains("flavor_id       = \"2008\""));
        // second floating IP lands on the first worker
        assert!(tf.contains("openstack_compute_instance_v2.k8s-prod-node13.id"));
    }

    #[test]
    fn kubeconfig_targets_public_address() {
        let f = Fixture::new(3, 0);
        let script = &f.render()["kubeconfig.sh"];
        assert!(script.contains("--server=https://203.0.113.10"));
        assert!(script.contains("--client-certificate=tls/admin.pem"));
        assert!(script.contains("--certificate-authority=tls/ca.pem"));
        assert!(script.contains("In-cluster master host: 192.168.3.10"));
    }

    #[test]
    fn status_reports_cluster_id() {
        let f = Fixture::new(3, 0);
        let status = &f.render()["cluster.status"];
        assert!(status.starts_with("Cluster Info:\nEtcd ID token:\t6a28e078895c5ec737174db2419bb2f3\n"));
        assert!(status.contains("alphafeatures:\ttrue\n"));
    }

    #[test]
    fn disabled_alpha_features_render_lowercase() {
        let mut f = Fixture::new(3, 1);
        f.config.alpha_features = false;
        let docs = f.render();
        assert!(docs["cluster.status"].contains("alphafeatures:\tfalse\n"));
        let manager = &docs["node_192.168.3.10.yaml"];
        assert_eq!(env_value(manager, "ALPHA_FEATURES"), "false");
        assert!(!manager.contains("--feature-gates"));
    }

    #[test]
    fn missing_node_certificates_abort_rendering() {
        let issued = Fixture::new(3, 0);
        let bigger = config(3, 1);
        let topology = Topology::derive(&bigger).unwrap();
        let err = Renderer::new()
            .unwrap()
            .render_all(&bigger, &topology, &issued.pki, &issued.token)
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::MissingCertificates(ip) if ip == Ipv4Addr::new(192, 168, 3, 13)
        ));
    }
}
