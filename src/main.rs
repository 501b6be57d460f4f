mod cli;
mod config;
mod destination;
mod dimse;
mod editor;
mod engine;
mod error;
mod node;
mod registry;
mod scp;
mod scu;
mod state;
mod stow;
mod transcoder;
mod types;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ExitCode};
use config::AppConfig;
use destination::build_destination;
use node::DicomNode;
use registry::AssociationRegistry;
use scp::{DelayKnobs, StoreServiceClassProvider};

fn init_logger(level: &str) -> Result<(), anyhow::Error> {
	let log_level = tracing::Level::from_str(level)?;

	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(log_level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

/// Builds the Association Registry from the loaded config: every route's
/// destination names are resolved against `config.destinations`, built into
/// live `ForwardDestination`s, and registered under the route's source node.
fn build_registry(config: &AppConfig, calling_node: &DicomNode) -> anyhow::Result<AssociationRegistry> {
	let mut registry = AssociationRegistry::new();

	for route in &config.routes {
		let mut destinations = Vec::with_capacity(route.destinations.len());
		for name in &route.destinations {
			let destination_config = config
				.destinations
				.iter()
				.find(|candidate| candidate.name() == name)
				.ok_or_else(|| anyhow::anyhow!("route references unknown destination {name:?}"))?;
			destinations.push(build_destination(
				destination_config,
				calling_node,
				&config.server.connect_options,
			)?);
		}

		let mut source = DicomNode::new(route.source_aet.clone());
		if let Some(hostname) = &route.source_hostname {
			source = source.with_hostname(hostname.clone());
			source.validate_hostname = true;
		}
		registry.register(source, destinations);
	}

	Ok(registry)
}

async fn run_listen(config_path: std::path::PathBuf) -> anyhow::Result<ExitCode> {
	let config = AppConfig::load_from(&config_path)?;
	init_logger(&config.logging.level)?;
	debug!("Config: {config:?}");

	let calling_node = DicomNode::new(config.server.aet.clone());
	let registry = Arc::new(build_registry(&config, &calling_node)?);

	let transfer_syntaxes = load_transfer_syntaxes(config.transfer_capability_file.as_deref())?;

	let scp = Arc::new(StoreServiceClassProvider::new(
		config.server.aet.clone(),
		config.bind_calling_aet,
		config.authorized_calling_nodes.clone(),
		transfer_syntaxes,
		registry,
		DelayKnobs::default(),
	));

	let interface = SocketAddr::new(config.server.interface, config.server.port);
	info!(%interface, aet = %config.server.aet, "dicom-forward starting");

	// `bind` only ever returns early from its own `TcpListener::bind`; its
	// accept loop logs and keeps serving on a per-connection error instead of
	// returning. So any `Err` here is a network-layer failure, not a config one.
	match scp.bind(interface).await {
		Ok(()) => Ok(ExitCode::Success),
		Err(err) => {
			error!("failed to bind inbound C-STORE SCP: {err}");
			Ok(ExitCode::NetworkError)
		}
	}
}

/// Loads the proposed transfer syntax list from `path`, one UID per
/// non-empty, non-comment line. Absent `path` means "bundled defaults": the
/// inbound SCP then accepts every non-retired transfer syntax the registry
/// knows (see `ServerAssociation::new`).
fn load_transfer_syntaxes(path: Option<&str>) -> anyhow::Result<Vec<String>> {
	let Some(path) = path else {
		return Ok(Vec::new());
	};
	let contents = std::fs::read_to_string(path)?;
	Ok(contents
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.map(str::to_owned)
		.collect())
}

/// Parses `REMOTE@host:port` into a called [`DicomNode`], for the one-shot
/// `send` subcommand.
fn parse_destination(spec: &str) -> anyhow::Result<DicomNode> {
	let (aet, address) = spec
		.split_once('@')
		.ok_or_else(|| anyhow::anyhow!("destination must be AET@host:port, got {spec:?}"))?;
	let (host, port) = address
		.rsplit_once(':')
		.ok_or_else(|| anyhow::anyhow!("destination must be AET@host:port, got {spec:?}"))?;
	let port: u16 = port.parse()?;
	Ok(DicomNode::new(aet).with_hostname(host).with_port(port))
}

async fn run_send(destination: String, files: Vec<std::path::PathBuf>) -> anyhow::Result<ExitCode> {
	init_logger("info")?;

	let called_node = parse_destination(&destination)?;
	let calling_node = DicomNode::new("DICOM-FORWARD");

	let stream_scu = Arc::new(scu::StreamingStoreScu::new(calling_node.clone(), called_node.clone()));

	let mut failures = 0usize;
	let mut attempted = 0usize;

	for path in files {
		attempted += 1;
		match send_one(&stream_scu, &path).await {
			Ok(()) => info!(file = %path.display(), "sent"),
			Err(err) => {
				error!(file = %path.display(), "failed to send: {err}");
				failures += 1;
			}
		}
	}

	stream_scu.close(true).await;

	if attempted == 0 {
		Ok(ExitCode::ConfigError)
	} else if failures == attempted {
		Ok(ExitCode::NetworkError)
	} else if failures > 0 {
		Ok(ExitCode::PartialFailure)
	} else {
		Ok(ExitCode::Success)
	}
}

async fn send_one(stream_scu: &Arc<scu::StreamingStoreScu>, path: &std::path::Path) -> anyhow::Result<()> {
	let file = dicom::object::open_file(path)?;
	let meta = file.meta().clone();
	let dataset = file.into_inner();

	let cuid = meta.media_storage_sop_class_uid.clone();
	let iuid = meta.media_storage_sop_instance_uid.clone();
	let tsuid = meta.transfer_syntax.clone();

	stream_scu.prepare(&cuid, &tsuid).await?;
	let status = stream_scu
		.cstore(&cuid, &iuid, dataset, types::Priority::Medium, &tsuid)
		.await?;

	match types::Status::classify(status) {
		types::StatusClass::Success | types::StatusClass::Warning => Ok(()),
		types::StatusClass::Failure => Err(anyhow::anyhow!("C-STORE-RSP status {status:#06X}")),
	}
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let runtime = tokio::runtime::Runtime::new()?;
	let exit_code = runtime.block_on(async move {
		match cli.command {
			Command::Listen { config } => run_listen(config).await,
			Command::Send { destination, files } => run_send(destination, files).await,
		}
	});

	match exit_code {
		Ok(code) => std::process::exit(code as i32),
		Err(err) => {
			error!("{err}");
			std::process::exit(ExitCode::ConfigError as i32);
		}
	}
}

