// src/main.rs

use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use netdeploy::bootstrap::{
    standard_handoffs, AdminCli, Bootstrapper, FirewallBootstrapper, FirewallSettings, SubzoneBootstrapper,
    SubzoneSettings,
};
use netdeploy::config::validator::has_firewall_legs;
use netdeploy::config::ConfigManager;
use netdeploy::execution::stragglers::HostProcessTable;
use netdeploy::execution::{BoxedExecutor, ChildOutput, HostExecutor, ProcessSupervisor, SupervisorSettings};
use netdeploy::scaling::{FleetSettings, NodeFleetManager};
use netdeploy::sequencer::{
    shutdown_channel, DeploymentLock, DeploymentMode, DeploymentPlan, DeploymentSequencer, Outcome,
    SequencerSettings, ShutdownTrigger,
};
use netdeploy::service::{gate, CleanOptions, FirewallRole, ServiceCatalog};
use structopt::StructOpt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "netdeploy", about = "Deploys and supervises a network-manager service fleet")]
struct Opt {
    /// Path to configuration file
    #[structopt(short, long, parse(from_os_str), default_value = "deployment.yaml")]
    config: PathBuf,

    /// Debug logging, with service output on the terminal
    #[structopt(short, long)]
    verbose: bool,

    /// Serve Prometheus metrics on this address
    #[structopt(long)]
    metrics_addr: Option<SocketAddr>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Deploy services and supervise them until interrupted
    Deploy {
        /// network, nodes or full
        #[structopt(long, default_value = "full")]
        mode: DeploymentMode,

        /// Node replicas to create; 0 adopts the existing ones
        #[structopt(long, default_value = "0")]
        nodes: u32,

        /// Run nodes behind the bridge and float
        #[structopt(long)]
        firewall: bool,

        /// Seconds between health checks
        #[structopt(long)]
        health_check_frequency: Option<u64>,
    },

    /// Remove generated files from service directories
    Clean {
        /// Delete node replicas; strip everything from other services
        #[structopt(long)]
        deep: bool,

        /// Strip jars, zips and drivers
        #[structopt(long)]
        artifacts: bool,

        /// Strip certificate directories
        #[structopt(long)]
        certs: bool,

        /// Strip logs, databases and other runtime state
        #[structopt(long)]
        runtime: bool,

        /// Only touch node replicas
        #[structopt(long)]
        nodes_only: bool,
    },

    /// Check configuration, config files and certificates
    Validate,

    /// Register the subzone against an already running network
    Subzone,

    /// Write the default configuration
    Init {
        /// Destination file
        #[structopt(short, long, parse(from_os_str), default_value = "deployment.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse command-line arguments
    let opt = Opt::from_args();

    // Initialize tracing
    let filter = if opt.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting netdeploy...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Some(addr) = opt.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Serving metrics on {}", addr);
    }

    if let Command::Init { output } = &opt.command {
        let manager = ConfigManager::with_config(ConfigManager::default_config())?;
        manager.save_to_file(output)?;
        info!("Wrote default configuration to {}", output.display());
        return Ok(());
    }

    // Load configuration
    info!("Loading configuration from: {}", opt.config.display());
    let manager = ConfigManager::load_from_file(&opt.config).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let catalog = ServiceCatalog::from_config(manager.get_config())?;
    let executor = HostExecutor::new().as_executor();

    match opt.command {
        Command::Deploy {
            mode,
            nodes,
            firewall,
            health_check_frequency,
        } => {
            deploy(
                &manager,
                &catalog,
                executor,
                DeployArgs {
                    mode,
                    nodes,
                    firewall,
                    health_check_frequency,
                    verbose: opt.verbose,
                },
            )
            .await
        }
        Command::Clean {
            deep,
            artifacts,
            certs,
            runtime,
            nodes_only,
        } => clean(
            &manager,
            &catalog,
            executor,
            CleanOptions {
                deep,
                artifacts,
                certs,
                runtime,
            },
            nodes_only,
        ),
        Command::Validate => validate(&manager, &catalog, executor),
        Command::Subzone => {
            let bootstrapper = subzone_bootstrapper(&manager, &catalog, executor)?;
            bootstrapper.setup().await?;
            Ok(())
        }
        Command::Init { .. } => Ok(()),
    }
}

struct DeployArgs {
    mode: DeploymentMode,
    nodes: u32,
    firewall: bool,
    health_check_frequency: Option<u64>,
    verbose: bool,
}

async fn deploy(
    manager: &ConfigManager,
    catalog: &ServiceCatalog,
    executor: BoxedExecutor,
    args: DeployArgs,
) -> Result<(), Box<dyn Error>> {
    let config = manager.get_config();

    // Validate deploy options
    if args.firewall && !has_firewall_legs(config) {
        return Err("Firewall mode needs bridge and float services in the catalog".into());
    }
    if args.firewall && !args.mode.includes_nodes() {
        warn!("--firewall has no effect in {} mode", args.mode);
    }

    // Claim the deployment root
    let lock = DeploymentLock::acquire(&config.root_dir)?;

    // Reconcile node replicas
    let mut node_descriptors = Vec::new();
    let mut replicas = Vec::new();
    if args.mode.includes_nodes() {
        let fleet = NodeFleetManager::new(
            catalog.node_template().clone(),
            FleetSettings::from_config(&config.nodes, args.firewall),
            executor.clone(),
        );
        let instances = fleet.reconcile_or_create(args.nodes).await?;
        if instances.is_empty() {
            warn!("No node replicas exist; pass --nodes to create some");
        }
        node_descriptors = fleet.deployment_list(&instances)?;
        replicas = instances
            .iter()
            .map(|i| (i.ordinal, i.descriptor.dir.clone()))
            .collect();
    }

    // Build the deployment plan
    let plan = DeploymentPlan::build(args.mode, catalog, node_descriptors, args.firewall, &config.subzone);

    // Initialize process supervisor
    let output = if args.verbose {
        ChildOutput::Inherit
    } else {
        let log_file = config.log_file();
        if let Some(dir) = log_file.parent() {
            fs::create_dir_all(dir)?;
        }
        info!("Service output is appended to {}", log_file.display());
        ChildOutput::LogFile(log_file)
    };
    let mut supervisor = ProcessSupervisor::new(SupervisorSettings {
        output,
        inner_restart_delay: Duration::from_millis(config.supervisor.inner_restart_delay_ms),
        stop_grace: Duration::from_secs(config.supervisor.stop_grace_secs),
    });
    for (name, handoff) in standard_handoffs(config, catalog, executor.clone(), Arc::new(HostProcessTable::new())) {
        info!("{} waits for its {} handoff", name, handoff.name());
        supervisor = supervisor.with_handoff(name, handoff);
    }
    let supervisor = Arc::new(supervisor);

    // Initialize sequencer and bootstrappers
    let mut settings = SequencerSettings::from_config(config);
    if let Some(secs) = args.health_check_frequency {
        settings.health_check_frequency = Duration::from_secs(secs);
    }

    let mut sequencer = DeploymentSequencer::new(supervisor, settings).with_lock(lock);
    if plan.run_subzone {
        sequencer = sequencer.with_subzone(Box::new(subzone_bootstrapper(manager, catalog, executor.clone())?));
    }
    if plan.firewall {
        let legs = [FirewallRole::Bridge, FirewallRole::Float]
            .into_iter()
            .filter_map(|role| catalog.firewall_leg(role))
            .map(|leg| leg.dir.clone())
            .collect();
        sequencer = sequencer.with_firewall(Box::new(FirewallBootstrapper::new(
            executor,
            FirewallSettings::from_config(&config.firewall, config)?,
            catalog.node_template().clone(),
            legs,
            replicas,
        )));
    }

    // Set up signal handling
    let (trigger, shutdown) = shutdown_channel();
    watch_signals(trigger)?;

    match sequencer.run(plan, shutdown).await? {
        Outcome::Interrupted(report) => {
            info!(
                "Stopped {} processes, removed {} temporary paths",
                report.stopped,
                report.removed.len()
            );
            info!("All processes terminated, exiting");
            std::process::exit(1);
        }
    }
}

/// Fires `trigger` on SIGINT or SIGTERM; repeats are logged and ignored
fn watch_signals(trigger: ShutdownTrigger) -> Result<(), Box<dyn Error>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if trigger.trigger() {
                info!("Received {}, shutting down...", name);
            } else {
                warn!("Received {} while shutting down, ignoring", name);
            }
        }
    });
    Ok(())
}

fn clean(
    manager: &ConfigManager,
    catalog: &ServiceCatalog,
    executor: BoxedExecutor,
    options: CleanOptions,
    nodes_only: bool,
) -> Result<(), Box<dyn Error>> {
    if options.is_empty() {
        warn!("Nothing to clean; pass --deep, --artifacts, --certs or --runtime");
        return Ok(());
    }

    let config = manager.get_config();
    if !nodes_only {
        for service in catalog.services() {
            let report = service.clean(&options)?;
            info!("{}: removed {} paths", service.abbreviation, report.removed.len());
        }
    }

    let fleet = NodeFleetManager::new(
        catalog.node_template().clone(),
        FleetSettings::from_config(&config.nodes, false),
        executor,
    );
    fleet.clean_fleet(&options)?;
    Ok(())
}

fn validate(manager: &ConfigManager, catalog: &ServiceCatalog, executor: BoxedExecutor) -> Result<(), Box<dyn Error>> {
    let config = manager.get_config();
    let fleet = NodeFleetManager::new(
        catalog.node_template().clone(),
        FleetSettings::from_config(&config.nodes, false),
        executor,
    );

    let mut services = catalog.services().to_vec();
    for (ordinal, dir) in fleet.discover()? {
        services.push(catalog.node_template().replica(ordinal, dir));
    }

    let report = gate::check_all(&services);
    println!("{}", report.checklist());
    report.into_result()?;
    info!("Configuration {} is valid", config_label(manager));
    Ok(())
}

fn config_label(manager: &ConfigManager) -> String {
    manager
        .config_path()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

fn subzone_bootstrapper(
    manager: &ConfigManager,
    catalog: &ServiceCatalog,
    executor: BoxedExecutor,
) -> Result<SubzoneBootstrapper, Box<dyn Error>> {
    let config = manager.get_config();
    let cli = AdminCli::new(
        executor.clone(),
        &config.subzone.admin_tool,
        config,
        manager.admin_password()?,
    );
    let settings = SubzoneSettings::from_config(&config.subzone, catalog)?;
    Ok(SubzoneBootstrapper::new(executor, cli, settings))
}
