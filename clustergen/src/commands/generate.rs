use std::{
    collections::HashMap,
    fs::{self, set_permissions, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
};

use anyhow::{Context, Result};
use common::{
    config::{self, OutputSettings, Settings},
    exit,
    progress::{stage, DISCOVERY, ISSUANCE, RENDER, TOPOLOGY, WRITE},
    DiscoveryToken,
};
use console::style;
use pki::{ClusterPki, PkiFile};
use renderer::{RenderedArtifact, Renderer};
use topology::Topology;
use tracing::info;

use crate::{
    args::{Cli, GenerateArgs},
    discovery::{EtcdDiscovery, StaticToken, TokenSource},
};

/// Everything one run produced, already on disk.
#[derive(Debug)]
pub struct Generated {
    pub token: DiscoveryToken,
    pub artifacts: Vec<RenderedArtifact>,
    pub pki_files: Vec<PkiFile>,
}

impl Generated {
    pub fn artifact(&self, name: &str) -> Option<&RenderedArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

pub async fn generate(cli: &Cli, args: &GenerateArgs) -> Result<()> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let settings = match config::load(cli.file.as_deref(), &env, args.overrides()) {
        Ok(s) => s,
        Err(err) => exit!(err, "Could not load cluster configuration"),
    };
    info!(
        cluster = %settings.cluster.cluster_name,
        managers = settings.cluster.managers,
        workers = settings.cluster.workers,
        "configuration loaded"
    );

    let source: Box<dyn TokenSource + Send + Sync> = match &settings.discovery.token {
        Some(token) => Box::new(StaticToken::new(token.as_str())),
        None => Box::new(EtcdDiscovery::new(
            settings.discovery.url.as_str(),
            settings.discovery.timeout,
        )?),
    };

    let generated = run(&settings, source.as_ref(), cli.verbose).await?;
    print_summary(&generated);
    Ok(())
}

/// Runs the pipeline. Nothing is written unless every stage before the
/// write succeeded.
pub async fn run(
    settings: &Settings,
    source: &(dyn TokenSource + Send + Sync),
    verbose: bool,
) -> Result<Generated> {
    let config = &settings.cluster;

    let topology = stage(TOPOLOGY, &config.subnet_cidr.to_string(), verbose, async {
        Ok(Topology::derive(config)?)
    })
    .await?;

    let token = stage(DISCOVERY, &source.name(), verbose, async {
        Ok(source.token(config.managers).await?)
    })
    .await?;

    let nodes = format!("{} nodes", topology.nodes.len());
    let pki = stage(ISSUANCE, &nodes, verbose, async {
        Ok(ClusterPki::issue(config, &topology)?)
    })
    .await?;

    let renderer = Renderer::with_pki_dir(pki_dir_for_scripts(&settings.output))?;
    let artifacts = stage(RENDER, &config.cluster_name, verbose, async {
        Ok(renderer.render_all(config, &topology, &pki, &token)?)
    })
    .await?;

    let pki_files = pki.files();
    let out = settings.output.dir.display().to_string();
    stage(WRITE, &out, verbose, async {
        write_all(&settings.output, &artifacts, &pki_files)
    })
    .await?;

    Ok(Generated {
        token,
        artifacts,
        pki_files,
    })
}

/// The kubeconfig script runs from the output directory, so it refers to the
/// key material relative to it when possible.
fn pki_dir_for_scripts(output: &OutputSettings) -> String {
    output
        .pki_dir
        .strip_prefix(&output.dir)
        .unwrap_or(&output.pki_dir)
        .display()
        .to_string()
}

pub fn write_all(
    output: &OutputSettings,
    artifacts: &[RenderedArtifact],
    pki_files: &[PkiFile],
) -> Result<()> {
    fs::create_dir_all(&output.dir)
        .with_context(|| format!("Could not create {}", output.dir.display()))?;
    fs::create_dir_all(&output.pki_dir)
        .with_context(|| format!("Could not create {}", output.pki_dir.display()))?;

    let documents = artifacts
        .iter()
        .map(|a| (output.dir.join(&a.name), &a.contents, a.secret));
    let key_material = pki_files
        .iter()
        .map(|f| (output.pki_dir.join(&f.name), &f.contents, f.secret));

    for (path, contents, secret) in documents.chain(key_material) {
        let written = if secret {
            write_secret(&path, contents)
        } else {
            fs::write(&path, contents).map_err(anyhow::Error::from)
        };
        written.with_context(|| format!("Could not write {}", path.display()))?;
    }

    info!(
        artifacts = artifacts.len(),
        pki_files = pki_files.len(),
        "artifacts written"
    );
    Ok(())
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(contents.as_bytes())?;
    // mode only applies on creation
    set_permissions(path, Permissions::from_mode(0o600))?;
    Ok(())
}

fn print_summary(generated: &Generated) {
    let rule = "-".repeat(40);
    println!("{rule}\n");
    if let Some(status) = generated.artifact(renderer::templates::CLUSTER_STATUS) {
        print!("{}", status.contents);
    }
    println!("{rule}\n");
    println!(
        "To start building the cluster: \t{}",
        style("terraform init && terraform plan && terraform apply").bold()
    );
    println!(
        "To interact with the cluster: \t{}",
        style("sh kubeconfig.sh").bold()
    );
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use common::config::{ClusterSection, OutputSection, PartialConfig};
    use pki::verify::verify_dir;

    use super::*;
    use crate::discovery::DiscoveryError;

    const TOKEN: &str = "https://discovery.etcd.io/6a28e078895c5ec737174db2419bb2f3";

    struct Unreachable;

    #[async_trait::async_trait]
    impl TokenSource for Unreachable {
        async fn token(&self, _size: usize) -> Result<DiscoveryToken, DiscoveryError> {
            Err(DiscoveryError::Empty {
                url: self.name(),
            })
        }

        fn name(self: &Self) -> String {
            "unreachable".to_owned()
        }
    }

    fn settings(dir: &Path, managers: usize, workers: usize) -> Settings {
        let layer = PartialConfig {
            cluster: ClusterSection {
                name: Some("prod".to_owned()),
                managers: Some(managers),
                workers: Some(workers),
                keypair: Some("ops".to_owned()),
                floating_ip1: Some("203.0.113.10".parse().unwrap()),
                floating_ip2: Some("203.0.113.11".parse().unwrap()),
                ..Default::default()
            },
            output: OutputSection {
                dir: Some(dir.to_path_buf()),
                pki_dir: None,
            },
            ..Default::default()
        };
        config::load(None, &HashMap::new(), layer).unwrap()
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn writes_artifacts_and_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), 3, 1);
        let generated = run(&settings, &StaticToken::new(TOKEN), true).await.unwrap();

        assert_eq!(generated.token.cluster_id(), "6a28e078895c5ec737174db2419bb2f3");
        assert_eq!(
            listing(dir.path()),
            [
                "calico.yaml",
                "cloud.conf",
                "cluster.status",
                "k8s.tf",
                "kubeconfig.sh",
                "node_192.168.3.10.yaml",
                "node_192.168.3.11.yaml",
                "node_192.168.3.12.yaml",
                "node_192.168.3.13.yaml",
                "tls",
            ]
        );

        let pki_dir = dir.path().join("tls");
        assert_eq!(listing(&pki_dir).len(), generated.pki_files.len());
        for file in &generated.pki_files {
            let mode = fs::metadata(pki_dir.join(&file.name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            if file.secret {
                assert_eq!(mode, 0o600, "{}", file.name);
            } else {
                assert_ne!(mode, 0o600, "{}", file.name);
            }
        }

        for artifact in &generated.artifacts {
            let mode = fs::metadata(dir.path().join(&artifact.name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode == 0o600, artifact.name == "cloud.conf", "{}", artifact.name);
        }

        let verified = verify_dir(&pki_dir).unwrap();
        assert_eq!(verified.len(), 4 * 2 + 3);

        let script = fs::read_to_string(dir.path().join("kubeconfig.sh")).unwrap();
        assert!(script.contains("--client-key=tls/admin-key.pem"));
    }

    #[tokio::test]
    async fn too_few_managers_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let settings = settings(&out, 2, 4);

        let err = run(&settings, &StaticToken::new(TOKEN), true).await.unwrap_err();
        assert!(format!("{err:#}").contains("managers need to be no less than 3"));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn discovery_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let settings = settings(&out, 3, 0);

        let err = run(&settings, &Unreachable, true).await.unwrap_err();
        assert!(format!("{err:#}").contains("Could not obtain discovery token"));
        assert!(!out.exists());
    }

    #[test]
    fn scripts_see_pki_relative_to_output() {
        let nested = OutputSettings {
            dir: PathBuf::from("/srv/cluster"),
            pki_dir: PathBuf::from("/srv/cluster/secrets/tls"),
        };
        assert_eq!(pki_dir_for_scripts(&nested), "secrets/tls");

        let elsewhere = OutputSettings {
            dir: PathBuf::from("/srv/cluster"),
            pki_dir: PathBuf::from("/etc/pki/cluster"),
        };
        assert_eq!(pki_dir_for_scripts(&elsewhere), "/etc/pki/cluster");
    }
}
