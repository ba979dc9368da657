// src/bootstrap/handoff.rs

//! Files one service must receive from another before it may start.
//!
//! A handoff runs inside the receiving service's supervisor task, ahead of the
//! first command launch and again after every outer restart, so a wait here
//! never holds up the launch sequence. Every handoff skips the work it has
//! already done.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{io_error, BootstrapError};
use crate::config::rewrite::{self, quote, RewriteError};
use crate::config::{DeploymentConfig, HandoffConfig, ToolCommand};
use crate::execution::stragglers::ProcessTable;
use crate::execution::{BoxedExecutor, CommandSpec};
use crate::service::{node_info_files, CommandTemplate, ServiceCatalog, ServiceDescriptor};

/// Network parameters key naming the notary's node info file
pub const NOTARY_NODE_INFO_KEY: &str = "notaryNodeInfoFile";

/// Pre-launch step of one service
#[async_trait]
pub trait Handoff: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Prepares `service`; returns once it may be launched
    async fn prepare(&self, service: &ServiceDescriptor) -> Result<(), BootstrapError>;
}

/// Shared handle to a handoff
pub type BoxedHandoff = Arc<dyn Handoff>;

/// Builds a command from a program and arguments, masking the value after
/// every `*-password` flag
fn command(program: &str, args: Vec<String>) -> CommandSpec {
    let mut spec = CommandSpec::new(program);
    let mut secret_next = false;
    for arg in args {
        let flags_secret = !secret_next && arg.ends_with("-password");
        spec = if secret_next { spec.secret_arg(arg) } else { spec.arg(arg) };
        secret_next = flags_secret;
    }
    spec
}

/// Network map preparation: adopt the notary's node info into the network
/// parameters and register them
pub struct NetworkParametersHandoff {
    executor: BoxedExecutor,
    notary_dir: PathBuf,
    parameters_file: String,
    set_parameters_args: Vec<String>,
    poll: Duration,
}

impl NetworkParametersHandoff {
    /// Creates the handoff for a network map fed by the notary in `notary_dir`
    pub fn new(
        executor: BoxedExecutor,
        notary_dir: PathBuf,
        parameters_file: String,
        set_parameters_args: Vec<String>,
        poll: Duration,
    ) -> Self {
        Self {
            executor,
            notary_dir,
            parameters_file,
            set_parameters_args,
            poll,
        }
    }

    async fn wait_for_notary(&self) -> Vec<PathBuf> {
        loop {
            let files = node_info_files(&self.notary_dir);
            if !files.is_empty() {
                return files;
            }
            info!("Waiting for notary node info in {}", self.notary_dir.display());
            tokio::time::sleep(self.poll).await;
        }
    }
}

#[async_trait]
impl Handoff for NetworkParametersHandoff {
    fn name(&self) -> &'static str {
        "network parameters"
    }

    async fn prepare(&self, service: &ServiceDescriptor) -> Result<(), BootstrapError> {
        if !node_info_files(&service.dir).is_empty() {
            debug!("{} already holds node info, network parameters are set", service.abbreviation);
            return Ok(());
        }

        let files = self.wait_for_notary().await;
        let mut copied = Vec::with_capacity(files.len());
        for file in &files {
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let target = service.dir.join(&name);
            fs::copy(file, &target).map_err(io_error(&target))?;
            copied.push(name);
        }
        info!("Copied notary node info {:?} to {}", copied, service.abbreviation);

        let parameters = service.dir.join(&self.parameters_file);
        let node_info = copied.first().cloned().unwrap_or_default();
        rewrite::rewrite_file(&parameters, |contents| {
            match rewrite::set_key_anywhere(contents, NOTARY_NODE_INFO_KEY, &quote(&node_info)) {
                (_, 0) => Err(RewriteError::FieldNotFound {
                    path: parameters.clone(),
                    field: NOTARY_NODE_INFO_KEY.to_string(),
                }),
                (updated, _) => Ok(updated),
            }
        })?;
        debug!("{} now names {}", parameters.display(), node_info);

        let config = service.config_files.first().map(String::as_str).unwrap_or_default();
        let template = CommandTemplate {
            program: service.command.program.clone(),
            args: self.set_parameters_args.clone(),
        };
        let spec = command(&template.program, template.render(&service.artifact, config, &service.version))
            .current_dir(&service.dir);
        info!("Setting network parameters for {}", service.abbreviation);
        self.executor.execute(&spec).await?;
        Ok(())
    }
}

/// Broker preparation: create the broker instance once, then hold the broker
/// back until the float is running
pub struct BrokerHandoff {
    executor: BoxedExecutor,
    table: Arc<dyn ProcessTable>,
    instance_marker: PathBuf,
    tool: Option<(PathBuf, ToolCommand)>,
    float_dir: PathBuf,
    float_pattern: String,
    poll: Duration,
}

impl BrokerHandoff {
    /// Creates the handoff; `tool` carries its resolved working directory
    pub fn new(
        executor: BoxedExecutor,
        table: Arc<dyn ProcessTable>,
        instance_marker: PathBuf,
        tool: Option<(PathBuf, ToolCommand)>,
        float: &ServiceDescriptor,
        poll: Duration,
    ) -> Self {
        Self {
            executor,
            table,
            instance_marker,
            tool,
            float_dir: float.dir.clone(),
            float_pattern: float.process_pattern.clone(),
            poll,
        }
    }

    async fn configure(&self, broker_dir: &Path) -> Result<(), BootstrapError> {
        let Some((tool_dir, tool)) = &self.tool else {
            warn!("Broker in {} is not configured and no tool is set up to configure it", broker_dir.display());
            return Ok(());
        };

        let broker = broker_dir.display().to_string();
        let args = tool.args.iter().map(|a| a.replace("{broker_dir}", &broker)).collect();
        info!("Configuring broker in {}", broker_dir.display());
        self.executor
            .execute(&command(&tool.program, args).current_dir(tool_dir))
            .await?;

        let destination = broker_dir.join(&tool.copy_to);
        fs::create_dir_all(&destination).map_err(io_error(&destination))?;
        for file in &tool.copy_files {
            let source = tool_dir.join(file);
            let target = destination.join(file.file_name().unwrap_or(file.as_os_str()));
            fs::copy(&source, &target).map_err(io_error(&source))?;
        }
        Ok(())
    }

    async fn wait_for_float(&self) {
        while self.table.count_running_in(&self.float_pattern, &self.float_dir) == 0 {
            info!("Waiting for the float in {} to start", self.float_dir.display());
            tokio::time::sleep(self.poll).await;
        }
        info!("Float started, starting the broker");
    }
}

#[async_trait]
impl Handoff for BrokerHandoff {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn prepare(&self, service: &ServiceDescriptor) -> Result<(), BootstrapError> {
        if !service.dir.join(&self.instance_marker).exists() {
            self.configure(&service.dir).await?;
        }
        self.wait_for_float().await;
        Ok(())
    }
}

/// Handoffs of the standard topology, keyed by the receiving service; a
/// handoff whose services are not in the catalog is left out
pub fn standard_handoffs(
    config: &DeploymentConfig,
    catalog: &ServiceCatalog,
    executor: BoxedExecutor,
    table: Arc<dyn ProcessTable>,
) -> Vec<(String, BoxedHandoff)> {
    let h: &HandoffConfig = &config.handoffs;
    let poll = Duration::from_secs(h.poll_interval_secs);
    let mut handoffs: Vec<(String, BoxedHandoff)> = Vec::new();

    if let (Some(nmap), Some(notary)) = (catalog.get(&h.network_map), catalog.get(&h.notary)) {
        handoffs.push((
            nmap.abbreviation.clone(),
            Arc::new(NetworkParametersHandoff::new(
                executor.clone(),
                notary.dir.clone(),
                h.network_parameters.clone(),
                h.set_parameters_args.clone(),
                poll,
            )),
        ));
    }

    if let (Some(broker), Some(float)) = (catalog.get(&h.broker), catalog.get(&h.float)) {
        let tool = h.broker_tool.as_ref().map(|t| (config.resolve(&t.dir), t.clone()));
        handoffs.push((
            broker.abbreviation.clone(),
            Arc::new(BrokerHandoff::new(
                executor,
                table,
                h.broker_instance_marker.clone(),
                tool,
                float,
                poll,
            )),
        ));
    }

    handoffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fake::FakeExecutor;
    use crate::execution::stragglers::MockProcessTable;
    use crate::execution::CommandOutput;
    use crate::service::tests::{config_at, descriptor};
    use crate::service::ServiceKind;
    use mockall::predicate::eq;
    use mockall::Sequence;

    const PARAMETERS: &str = "notaries : [\n  {\n    notaryNodeInfoFile: \"INSERT_NODE_INFO_FILE_NAME_HERE\"\n    validating = false\n  }\n]\nminimumPlatformVersion = 4\n";

    fn nmap(root: &Path) -> ServiceDescriptor {
        let dir = root.join("cenm-nmap");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("network-parameters.conf"), PARAMETERS).unwrap();
        let mut service = descriptor("nmap", &dir, ServiceKind::Plain);
        service.artifact = "networkmap".to_string();
        service.command.program = "java".to_string();
        service.config_files = vec!["network-map.conf".to_string()];
        service
    }

    fn parameters_handoff(root: &Path, executor: BoxedExecutor) -> NetworkParametersHandoff {
        NetworkParametersHandoff::new(
            executor,
            root.join("cenm-notary"),
            "network-parameters.conf".to_string(),
            HandoffConfig::default().set_parameters_args,
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn network_map_waits_for_the_notary_node_info() {
        let root = tempfile::tempdir().unwrap();
        let notary = root.path().join("cenm-notary");
        fs::create_dir_all(&notary).unwrap();
        let service = nmap(root.path());
        let executor = FakeExecutor::new();
        let handoff = parameters_handoff(root.path(), executor.clone());

        let pending = tokio::time::timeout(Duration::from_millis(50), handoff.prepare(&service)).await;
        assert!(pending.is_err(), "prepared before the notary published node info");
        assert!(executor.calls().is_empty());

        fs::write(notary.join("nodeInfo-ABC123"), "info").unwrap();
        handoff.prepare(&service).await.unwrap();

        assert_eq!(fs::read_to_string(service.dir.join("nodeInfo-ABC123")).unwrap(), "info");
        let parameters = fs::read_to_string(service.dir.join("network-parameters.conf")).unwrap();
        assert!(parameters.contains("notaryNodeInfoFile: \"nodeInfo-ABC123\""));

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "java");
        assert_eq!(calls[0].cwd.as_deref(), Some(service.dir.as_path()));
        assert_eq!(
            &calls[0].args[..6],
            ["-jar", "networkmap.jar", "-f", "network-map.conf", "--set-network-parameters", "network-parameters.conf"]
        );
        assert!(!calls[0].to_string().contains("trustpass"));
    }

    #[tokio::test]
    async fn network_map_with_node_info_is_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let service = nmap(root.path());
        fs::write(service.dir.join("nodeInfo-OLD"), "info").unwrap();
        let executor = FakeExecutor::new();

        parameters_handoff(root.path(), executor.clone())
            .prepare(&service)
            .await
            .unwrap();

        assert!(executor.calls().is_empty());
        assert_eq!(fs::read_to_string(service.dir.join("network-parameters.conf")).unwrap(), PARAMETERS);
    }

    #[tokio::test]
    async fn parameters_without_notary_key_are_an_error() {
        let root = tempfile::tempdir().unwrap();
        let notary = root.path().join("cenm-notary");
        fs::create_dir_all(&notary).unwrap();
        fs::write(notary.join("nodeInfo-ABC123"), "info").unwrap();
        let service = nmap(root.path());
        fs::write(service.dir.join("network-parameters.conf"), "minimumPlatformVersion = 4\n").unwrap();
        let executor = FakeExecutor::new();

        let err = parameters_handoff(root.path(), executor.clone())
            .prepare(&service)
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Rewrite(RewriteError::FieldNotFound { .. })));
        assert!(executor.calls().is_empty());
    }

    struct BrokerFixture {
        root: tempfile::TempDir,
        broker: ServiceDescriptor,
        float: ServiceDescriptor,
    }

    impl BrokerFixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let tools = root.path().join("corda-tools/artemis");
            fs::create_dir_all(&tools).unwrap();
            fs::write(tools.join("artemis.jks"), "ks").unwrap();
            fs::write(tools.join("artemis-truststore.jks"), "ts").unwrap();
            let broker_dir = root.path().join("cenm-firewall/artemis");
            let float_dir = root.path().join("cenm-firewall/float");
            fs::create_dir_all(&broker_dir).unwrap();
            fs::create_dir_all(&float_dir).unwrap();

            let mut float = descriptor("float", &float_dir, ServiceKind::Plain);
            float.process_pattern = "corda-firewall.jar".to_string();
            Self {
                broker: descriptor("broker", &broker_dir, ServiceKind::Plain),
                float,
                root,
            }
        }

        fn handoff(&self, executor: BoxedExecutor, table: MockProcessTable) -> BrokerHandoff {
            let tool = HandoffConfig::default().broker_tool.unwrap();
            BrokerHandoff::new(
                executor,
                Arc::new(table),
                PathBuf::from("bin/artemis"),
                Some((self.root.path().join("corda-tools"), tool)),
                &self.float,
                Duration::from_millis(5),
            )
        }
    }

    #[tokio::test]
    async fn broker_is_configured_and_waits_for_the_float() {
        let f = BrokerFixture::new();
        let executor = FakeExecutor::new();
        let float_dir = f.float.dir.clone();
        let mut table = MockProcessTable::new();
        let mut seq = Sequence::new();
        for running in [0usize, 0, 1] {
            table
                .expect_count_running_in()
                .with(eq("corda-firewall.jar"), eq(float_dir.clone()))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(running);
        }

        f.handoff(executor.clone(), table).prepare(&f.broker).await.unwrap();

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args.contains(&"configure-artemis".to_string()));
        assert!(calls[0].args.contains(&f.broker.dir.display().to_string()));
        assert!(!calls[0].to_string().contains("artemisStorePass"));
        assert_eq!(fs::read_to_string(f.broker.dir.join("etc/artemis/artemis.jks")).unwrap(), "ks");
        assert_eq!(
            fs::read_to_string(f.broker.dir.join("etc/artemis/artemis-truststore.jks")).unwrap(),
            "ts"
        );
    }

    #[tokio::test]
    async fn configured_broker_only_waits_for_the_float() {
        let f = BrokerFixture::new();
        fs::create_dir_all(f.broker.dir.join("bin")).unwrap();
        fs::write(f.broker.dir.join("bin/artemis"), "#!/bin/sh\n").unwrap();
        let executor = FakeExecutor::new();
        let mut table = MockProcessTable::new();
        table.expect_count_running_in().times(1).return_const(1usize);

        f.handoff(executor.clone(), table).prepare(&f.broker).await.unwrap();
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn broker_stays_blocked_while_the_float_is_down() {
        let f = BrokerFixture::new();
        fs::create_dir_all(f.broker.dir.join("bin")).unwrap();
        fs::write(f.broker.dir.join("bin/artemis"), "").unwrap();
        let mut table = MockProcessTable::new();
        table.expect_count_running_in().return_const(0usize);

        let handoff = f.handoff(FakeExecutor::new(), table);
        let waited = tokio::time::timeout(Duration::from_millis(50), handoff.prepare(&f.broker)).await;
        assert!(waited.is_err());
    }

    #[test]
    fn standard_handoffs_cover_network_map_and_broker() {
        let root = tempfile::tempdir().unwrap();
        let config = config_at(root.path());
        let catalog = ServiceCatalog::from_config(&config).unwrap();

        let handoffs = standard_handoffs(
            &config,
            &catalog,
            FakeExecutor::new(),
            Arc::new(MockProcessTable::new()),
        );
        let names: Vec<(&str, &str)> = handoffs.iter().map(|(s, h)| (s.as_str(), h.name())).collect();
        assert_eq!(names, vec![("nmap", "network parameters"), ("broker", "broker")]);
    }

    #[test]
    fn password_values_are_masked() {
        let spec = command(
            "java",
            vec!["--truststore-password".into(), "trustpass".into(), "--root-alias".into(), "x".into()],
        );
        assert_eq!(spec.to_string(), "java --truststore-password **** --root-alias x");
    }

    #[tokio::test]
    async fn failed_tool_reports_the_command() {
        let f = BrokerFixture::new();
        let executor = FakeExecutor::new();
        executor.set_handler(Box::new(|_| CommandOutput::failure(1, "no distribution")));
        let table = MockProcessTable::new();

        let err = f.handoff(executor, table).prepare(&f.broker).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Tool(_)));
    }
}
