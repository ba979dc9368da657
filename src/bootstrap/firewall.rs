// src/bootstrap/firewall.rs

//! Bridge/float provisioning from a running node fleet.
//!
//! The firewall legs trust every replica's TLS key through one shared
//! keystore, and need the network parameters a node writes on first contact
//! with the network map.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::{io_error, BootstrapError, Bootstrapper};
use crate::config::{ConfigError, DeploymentConfig, FirewallConfig};
use crate::execution::{BoxedExecutor, CommandSpec};
use crate::service::ServiceDescriptor;

/// File each node writes once it has joined the network
pub const NETWORK_PARAMETERS: &str = "network-parameters";

/// TLS keystore of a registered node, relative to its directory
pub const NODE_SSL_KEYSTORE: &str = "certificates/sslkeystore.jks";

/// Resolved firewall settings
#[derive(Debug, Clone)]
pub struct FirewallSettings {
    /// Scratch directory for the shared keystore
    pub tmp_dir: PathBuf,

    /// Shared keystore file name
    pub shared_keystore: String,

    /// Store password of every keystore involved
    pub store_password: SecretString,

    /// Alias of the TLS entry in each node keystore
    pub source_alias: String,

    /// Keystore tool executable
    pub keytool: String,

    /// Interval between keystore polls
    pub poll_interval: Duration,

    /// Sleep once every keystore exists
    pub settle: Duration,

    /// Upper bound on the template run
    pub template_timeout: Duration,
}

impl FirewallSettings {
    /// Resolves the settings against the deployment root
    pub fn from_config(firewall: &FirewallConfig, config: &DeploymentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            tmp_dir: config.resolve(&firewall.tmp_dir),
            shared_keystore: firewall.shared_keystore.clone(),
            store_password: firewall.store_password.resolve()?,
            source_alias: firewall.source_alias.clone(),
            keytool: firewall.keytool.clone(),
            poll_interval: Duration::from_secs(firewall.poll_interval_secs),
            settle: Duration::from_secs(firewall.settle_secs),
            template_timeout: Duration::from_secs(firewall.template_timeout_secs),
        })
    }

    /// Path of the merged keystore
    pub fn shared_keystore_path(&self) -> PathBuf {
        self.tmp_dir.join(&self.shared_keystore)
    }
}

/// Provisions the bridge and float legs
pub struct FirewallBootstrapper {
    executor: BoxedExecutor,
    settings: FirewallSettings,
    template: ServiceDescriptor,
    legs: Vec<PathBuf>,
    replicas: Vec<(u32, PathBuf)>,
}

impl FirewallBootstrapper {
    /// Creates a bootstrapper for the given leg directories and node replicas
    pub fn new(
        executor: BoxedExecutor,
        settings: FirewallSettings,
        template: ServiceDescriptor,
        legs: Vec<PathBuf>,
        replicas: Vec<(u32, PathBuf)>,
    ) -> Self {
        Self {
            executor,
            settings,
            template,
            legs,
            replicas,
        }
    }

    /// Whether every leg already holds network parameters
    pub fn already_provisioned(&self) -> bool {
        !self.legs.is_empty() && self.legs.iter().all(|leg| leg.join(NETWORK_PARAMETERS).is_file())
    }

    async fn wait_for_keystores(&self) {
        loop {
            let missing: Vec<u32> = self
                .replicas
                .iter()
                .filter(|(_, dir)| !dir.join(NODE_SSL_KEYSTORE).is_file())
                .map(|(ordinal, _)| *ordinal)
                .collect();
            if missing.is_empty() {
                break;
            }
            info!("Waiting for node keystores of replica(s) {:?}", missing);
            tokio::time::sleep(self.settings.poll_interval).await;
        }
        debug!("all node keystores present, settling for {:?}", self.settings.settle);
        tokio::time::sleep(self.settings.settle).await;
    }

    async fn merge_keystores(&self) -> Result<PathBuf, BootstrapError> {
        let s = &self.settings;
        let password = s.store_password.expose_secret();
        fs::create_dir_all(&s.tmp_dir).map_err(io_error(&s.tmp_dir))?;

        let shared = s.shared_keystore_path();
        if shared.exists() {
            fs::remove_file(&shared).map_err(io_error(&shared))?;
        }

        for (ordinal, dir) in &self.replicas {
            let spec = CommandSpec::new(&s.keytool)
                .args(["-importkeystore", "-srckeystore"])
                .arg(dir.join(NODE_SSL_KEYSTORE).display().to_string())
                .arg("-srcstorepass")
                .secret_arg(password.as_str())
                .args(["-srcalias", s.source_alias.as_str(), "-destkeystore"])
                .arg(shared.display().to_string())
                .arg("-deststorepass")
                .secret_arg(password.as_str())
                .arg("-destalias")
                .arg(format!("{}{}", s.source_alias, ordinal))
                .arg("-noprompt");
            self.executor.execute(&spec).await?;
        }
        info!("Merged {} node keystore(s) into {}", self.replicas.len(), shared.display());
        Ok(shared)
    }

    async fn produce_network_parameters(&self) -> Result<PathBuf, BootstrapError> {
        let spec = self.template.command_spec().timeout(self.settings.template_timeout);
        info!("Running {} to fetch network parameters", self.template.abbreviation);
        match self.executor.execute(&spec).await {
            Ok(output) if output.timed_out => {
                debug!("{} stopped after {:?}", self.template.abbreviation, self.settings.template_timeout)
            }
            Ok(_) => {}
            Err(e) => warn!("{} exited abnormally: {}", self.template.abbreviation, e),
        }

        let parameters = self.template.dir.join(NETWORK_PARAMETERS);
        if !parameters.is_file() {
            return Err(BootstrapError::MissingArtifact(parameters));
        }
        Ok(parameters)
    }

    fn distribute(&self, parameters: &Path, keystore: &Path) -> Result<(), BootstrapError> {
        for leg in &self.legs {
            copy(parameters, &leg.join(NETWORK_PARAMETERS))?;

            let certificates = leg.join("certificates");
            fs::create_dir_all(&certificates).map_err(io_error(&certificates))?;
            copy(keystore, &certificates.join(&self.settings.shared_keystore))?;
        }
        Ok(())
    }
}

fn copy(from: &Path, to: &Path) -> Result<(), BootstrapError> {
    fs::copy(from, to).map_err(io_error(to))?;
    debug!("copied {} to {}", from.display(), to.display());
    Ok(())
}

#[async_trait]
impl Bootstrapper for FirewallBootstrapper {
    fn name(&self) -> &'static str {
        "firewall"
    }

    async fn setup(&self) -> Result<(), BootstrapError> {
        if self.already_provisioned() {
            info!("Firewall legs already hold network parameters, skipping setup");
            return Ok(());
        }
        if self.replicas.is_empty() {
            return Err(BootstrapError::Configuration(
                "Firewall setup needs at least one node replica".to_string(),
            ));
        }

        self.wait_for_keystores().await;
        let keystore = self.merge_keystores().await?;
        let parameters = self.produce_network_parameters().await?;
        self.distribute(&parameters, &keystore)?;

        info!("Firewall legs provisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fake::FakeExecutor;
    use crate::execution::CommandOutput;
    use crate::service::tests::descriptor;
    use crate::service::{CertificateRequirement, ServiceKind};
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::Arc;

    struct Fixture {
        root: tempfile::TempDir,
        executor: Arc<FakeExecutor>,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            for dir in ["bridge", "float", "node", "node-1", "node-2"] {
                fs::create_dir_all(root.path().join(dir)).unwrap();
            }
            Self {
                root,
                executor: FakeExecutor::new(),
            }
        }

        fn path(&self, rel: &str) -> PathBuf {
            self.root.path().join(rel)
        }

        fn add_keystore(&self, replica: &str) {
            let path = self.path(replica).join(NODE_SSL_KEYSTORE);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, replica).unwrap();
        }

        /// Keytool appends the source keystore to the destination; the
        /// template writes network parameters when `write_parameters` is set
        fn script(&self, write_parameters: bool, template_fails: bool) {
            let template_dir = self.path("node");
            self.executor.set_handler(Box::new(move |spec| {
                if spec.program == "keytool" {
                    let value = |flag: &str| {
                        let i = spec.args.iter().position(|a| a == flag).unwrap();
                        spec.args[i + 1].clone()
                    };
                    let source = fs::read_to_string(value("-srckeystore")).unwrap();
                    let mut dest = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(value("-destkeystore"))
                        .unwrap();
                    writeln!(dest, "{} as {}", source, value("-destalias")).unwrap();
                    return CommandOutput::success("");
                }
                if write_parameters {
                    fs::write(template_dir.join(NETWORK_PARAMETERS), "params").unwrap();
                }
                if template_fails {
                    CommandOutput::failure(1, "node exited")
                } else {
                    CommandOutput::success("")
                }
            }));
        }

        fn bootstrapper(&self) -> FirewallBootstrapper {
            let settings = FirewallSettings {
                tmp_dir: self.path("tmp"),
                shared_keystore: "nodesUnitedSslKeystore.jks".to_string(),
                store_password: SecretString::new("cordacadevpass".to_string()),
                source_alias: "cordaclienttls".to_string(),
                keytool: "keytool".to_string(),
                poll_interval: Duration::from_millis(5),
                settle: Duration::from_millis(1),
                template_timeout: Duration::from_secs(1),
            };
            let template = descriptor(
                "node",
                &self.path("node"),
                ServiceKind::NodeRole {
                    ordinal: 0,
                    certificates: CertificateRequirement::default(),
                },
            );
            FirewallBootstrapper::new(
                self.executor.clone(),
                settings,
                template,
                vec![self.path("bridge"), self.path("float")],
                vec![(1, self.path("node-1")), (2, self.path("node-2"))],
            )
        }
    }

    #[tokio::test]
    async fn provisions_both_legs() {
        let f = Fixture::new();
        f.add_keystore("node-1");
        f.add_keystore("node-2");
        fs::create_dir_all(f.path("tmp")).unwrap();
        fs::write(f.path("tmp/nodesUnitedSslKeystore.jks"), "stale\n").unwrap();
        f.script(true, false);

        f.bootstrapper().setup().await.unwrap();

        for leg in ["bridge", "float"] {
            let params = fs::read_to_string(f.path(leg).join(NETWORK_PARAMETERS)).unwrap();
            assert_eq!(params, "params");
            let keystore =
                fs::read_to_string(f.path(leg).join("certificates/nodesUnitedSslKeystore.jks")).unwrap();
            assert_eq!(keystore, "node-1 as cordaclienttls1\nnode-2 as cordaclienttls2\n");
        }

        let calls = f.executor.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].args.contains(&"-noprompt".to_string()));
        assert!(!calls[0].to_string().contains("cordacadevpass"));
        assert_eq!(calls[2].timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn keystore_password_stays_out_of_debug_output() {
        let root = tempfile::tempdir().unwrap();
        let config = crate::service::tests::config_at(root.path());
        let settings = FirewallSettings::from_config(&config.firewall, &config).unwrap();

        assert_eq!(settings.store_password.expose_secret(), "cordacadevpass");
        assert!(!format!("{:?}", settings).contains("cordacadevpass"));
    }

    #[tokio::test]
    async fn skips_when_legs_are_provisioned() {
        let f = Fixture::new();
        fs::write(f.path("bridge").join(NETWORK_PARAMETERS), "p").unwrap();
        fs::write(f.path("float").join(NETWORK_PARAMETERS), "p").unwrap();

        f.bootstrapper().setup().await.unwrap();
        assert!(f.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn waits_for_late_keystores() {
        let f = Fixture::new();
        f.add_keystore("node-1");
        f.script(true, false);

        let late = f.path("node-2").join(NODE_SSL_KEYSTORE);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fs::create_dir_all(late.parent().unwrap()).unwrap();
            fs::write(late, "node-2").unwrap();
        });

        f.bootstrapper().setup().await.unwrap();
        writer.await.unwrap();
        assert!(f.path("float").join(NETWORK_PARAMETERS).is_file());
    }

    #[tokio::test]
    async fn abnormal_template_exit_is_tolerated() {
        let f = Fixture::new();
        f.add_keystore("node-1");
        f.add_keystore("node-2");
        f.script(true, true);

        f.bootstrapper().setup().await.unwrap();
        assert!(f.path("bridge").join(NETWORK_PARAMETERS).is_file());
    }

    #[tokio::test]
    async fn missing_network_parameters_is_an_error() {
        let f = Fixture::new();
        f.add_keystore("node-1");
        f.add_keystore("node-2");
        f.script(false, false);

        let err = f.bootstrapper().setup().await.unwrap_err();
        assert!(matches!(err, BootstrapError::MissingArtifact(p) if p.ends_with(NETWORK_PARAMETERS)));
        assert!(!f.path("bridge").join(NETWORK_PARAMETERS).exists());
    }
}
