//! Ignis CLI
//!
//! Generates node configuration, rolls it out, and reports drift.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ignis::analyze::DriftAnalyzer;
use ignis::cluster::{connect, KubeNodeApi};
use ignis::config::{DaemonSetMatch, HealthProfile, ProvisionSettings, DEFAULT_MAX_PARALLELISM};
use ignis::generate::{ConfigGenerator, DEFAULT_TEMPLATES_DIR, DEFAULT_VARS_DIR};
use ignis::pki::CfsslIssuer;
use ignis::provision::NodeProvisioner;
use ignis::resolve::JumpHostResolver;
use ignis::schedule::RoleScheduler;
use ignis::select::ChangeSelector;
use ignis::topology::ClusterTopology;
use ignis::transport::{RemoteTransport, SshTransport};

/// Ignis - rolling boot-configuration updates for bare-metal Kubernetes
#[derive(Parser, Debug)]
#[command(name = "ignis", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every action
#[derive(Args, Debug)]
struct GlobalArgs {
    /// Cluster name; also the kubeconfig context
    #[arg(long, short = 'c', env = "IGNIS_CLUSTER", global = true, default_value = "")]
    cluster: String,

    /// Only act on these hosts (comma separated)
    #[arg(long, env = "IGNIS_HOSTS", global = true, value_delimiter = ',')]
    hosts: Vec<String>,

    /// SSH identity file
    #[arg(
        long,
        short = 'i',
        env = "IGNIS_IDENTITY_FILE",
        global = true,
        default_value = "./id_deployer_rsa"
    )]
    identity_file: PathBuf,

    /// Remote user
    #[arg(long, env = "IGNIS_USER", global = true, default_value = "deployer")]
    user: String,

    /// Directory holding generated configuration
    #[arg(long, env = "IGNIS_OUTPUT_DIR", global = true, default_value = "output")]
    output_dir: PathBuf,

    /// Directory holding `<cluster>.yaml` topology files
    #[arg(long, env = "IGNIS_CLUSTERS_DIR", global = true, default_value = "clusters")]
    clusters_dir: PathBuf,

    /// Also append logs to this file
    #[arg(long, env = "IGNIS_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render configuration and certificates for every node
    Generate(GenerateArgs),

    /// Roll configuration out to nodes whose installed copy differs
    Provision(ProvisionArgs),

    /// Write a markdown report of installed vs generated configuration
    Analyze,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Template directory
    #[arg(long, env = "IGNIS_TEMPLATES_DIR", default_value = DEFAULT_TEMPLATES_DIR)]
    templates_dir: PathBuf,

    /// Cluster variables directory
    #[arg(long, env = "IGNIS_VARS_DIR", default_value = DEFAULT_VARS_DIR)]
    vars_dir: PathBuf,

    /// Resolve node addresses with `dig` on this host instead of locally
    #[arg(long, env = "IGNIS_JUMPHOST_DNS")]
    jumphost_dns: Option<String>,
}

#[derive(Args, Debug)]
struct ProvisionArgs {
    /// Do not drain workers, and skip the rejoin gate and relabel
    #[arg(long)]
    skip_drain: bool,

    /// The cluster is being built; skip the etcd quorum gate
    #[arg(long)]
    new_cluster: bool,

    /// Workers provisioned concurrently
    #[arg(long, env = "IGNIS_MAX_PARALLELISM", default_value_t = DEFAULT_MAX_PARALLELISM)]
    max_parallelism: usize,

    /// How many unhealthy etcd observations to tolerate
    #[arg(long, value_enum, default_value_t = HealthProfile::Conservative)]
    health_profile: HealthProfile,

    /// How pods are recognised as daemonset-managed
    #[arg(long, value_enum, default_value_t = DaemonSetMatch::OwnerReference)]
    daemonset_match: DaemonSetMatch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_file.as_deref())?;

    if cli.global.cluster.is_empty() {
        anyhow::bail!("--cluster (or IGNIS_CLUSTER) is required");
    }

    match cli.command {
        Command::Generate(args) => run_generate(&cli.global, args).await,
        Command::Provision(args) => run_provision(&cli.global, args).await,
        Command::Analyze => run_analyze(&cli.global).await,
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(())
}

fn load_topology(global: &GlobalArgs) -> anyhow::Result<ClusterTopology> {
    ClusterTopology::load(&global.clusters_dir, &global.cluster)
        .with_context(|| format!("failed to load topology for cluster {}", global.cluster))
}

fn ssh_transport(global: &GlobalArgs) -> Arc<dyn RemoteTransport> {
    Arc::new(SshTransport::new(&global.user, &global.identity_file))
}

async fn run_generate(global: &GlobalArgs, args: GenerateArgs) -> anyhow::Result<()> {
    let topology = load_topology(global)?;
    let transport = ssh_transport(global);
    let mut generator =
        ConfigGenerator::new(Arc::new(CfsslIssuer), transport.clone(), &global.output_dir)
            .with_templates_dir(args.templates_dir)
            .with_vars_dir(args.vars_dir)
            .with_identity_file(global.identity_file.display().to_string())
            .with_hosts(global.hosts.clone());
    if let Some(jumphost) = args.jumphost_dns {
        generator = generator.with_resolver(Arc::new(JumpHostResolver::new(transport, jumphost)));
    }

    let report = generator
        .generate(&global.cluster, &topology)
        .await
        .context("configuration generation failed")?;
    info!(
        rendered = report.rendered,
        fetched = report.fetched,
        certificates = report.certificates,
        "generate complete"
    );
    Ok(())
}

async fn run_provision(global: &GlobalArgs, args: ProvisionArgs) -> anyhow::Result<()> {
    let settings = ProvisionSettings {
        max_parallelism: args.max_parallelism,
        skip_drain: args.skip_drain,
        new_cluster: args.new_cluster,
        health_profile: args.health_profile,
        daemonset_match: args.daemonset_match,
        remote_user: global.user.clone(),
        output_dir: global.output_dir.clone(),
        ..ProvisionSettings::new(&global.cluster)
    };
    settings.validate().context("invalid provision settings")?;

    let topology = load_topology(global)?;
    let transport = ssh_transport(global);

    let selected = ChangeSelector::new(transport.clone(), &global.output_dir)
        .select(&topology, &global.hosts)
        .await
        .context("failed to select nodes")?;
    if selected.is_empty() {
        info!("all nodes are up to date, nothing to do");
        return Ok(());
    }

    let client = connect(&global.cluster)
        .await
        .with_context(|| format!("failed to connect to cluster {}", global.cluster))?;
    let api = Arc::new(KubeNodeApi::new(client));

    let max_parallelism = settings.max_parallelism;
    let provisioner = Arc::new(NodeProvisioner::new(transport, api, settings));
    let scheduler = RoleScheduler::new(provisioner, max_parallelism);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after in-flight steps");
            interrupt.cancel();
        }
    });

    let report = scheduler
        .run(&selected, &cancel)
        .await
        .context("provisioning failed")?;
    report.log_summary();
    Ok(())
}

async fn run_analyze(global: &GlobalArgs) -> anyhow::Result<()> {
    let topology = load_topology(global)?;
    let transport = ssh_transport(global);

    let selected = ChangeSelector::new(transport.clone(), &global.output_dir)
        .select(&topology, &global.hosts)
        .await
        .context("failed to select nodes")?;
    if selected.is_empty() {
        info!("all nodes are up to date, nothing to analyze");
        return Ok(());
    }

    let report = DriftAnalyzer::new(transport, &global.output_dir)
        .analyze(&global.cluster, &selected)
        .await
        .context("drift analysis failed")?;
    println!("{}", report.display());
    Ok(())
}
