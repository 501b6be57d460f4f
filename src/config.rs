//! Configuration surface: a layered
//! `config`-crate source (bundled defaults → `config.toml` in the working
//! directory → `DICOMFWD_`-prefixed environment variables).

use crate::node::DicomNode;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub logging: LoggingConfig,
	pub server: ServerConfig,
	#[serde(default)]
	pub authorized_calling_nodes: Vec<DicomNode>,
	#[serde(default)]
	pub bind_calling_aet: bool,
	#[serde(default)]
	pub transfer_capability_file: Option<String>,
	#[serde(default)]
	pub destinations: Vec<DestinationConfig>,
	#[serde(default)]
	pub routes: Vec<RouteConfig>,
}

impl AppConfig {
	/// Loads the configuration from bundled defaults, an optional
	/// `config.toml` in the working directory, and `DICOMFWD_`-prefixed
	/// environment variables.
	///
	/// # Errors
	/// Returns a [`config::ConfigError`] if no source could be parsed into
	/// a valid [`AppConfig`].
	pub fn load() -> Result<Self, config::ConfigError> {
		Self::load_from("config.toml")
	}

	/// Same layering as [`Self::load`], but reads the working-directory
	/// layer from `path` instead of the hardcoded `config.toml` (used by the
	/// `listen --config <path>` CLI flag).
	pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(include_str!("defaults.toml"), FileFormat::Toml))
			.add_source(File::from(path.as_ref()).required(false).format(FileFormat::Toml))
			.add_source(Environment::with_prefix("DICOMFWD").separator("__"))
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: String::from("info") }
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
	pub aet: String,
	pub interface: IpAddr,
	pub port: u16,
	#[serde(default)]
	pub connect_options: ConnectOptions,
}

/// Association-level timeouts and PDU/pooling limits for an outbound
/// connection, in milliseconds; `0` means "no timeout".
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectOptions {
	pub max_ops_invoked: u32,
	pub max_ops_performed: u32,
	pub max_pdu_len_rcv: u32,
	pub max_pdu_len_snd: u32,
	pub pack_pdv: bool,
	pub backlog: u32,
	pub tcp_no_delay: bool,
	pub snd_buf: u32,
	pub rcv_buf: u32,
	pub close_delay_ms: u64,
	pub connect_timeout_ms: u64,
	pub request_timeout_ms: u64,
	pub accept_timeout_ms: u64,
	pub release_timeout_ms: u64,
	pub response_timeout_ms: u64,
	pub retrieve_timeout_ms: u64,
	pub idle_timeout_ms: u64,
}

impl ConnectOptions {
	/// `0` means "no timeout"; callers that need an
	/// `Option<Duration>` use this rather than comparing to zero directly.
	#[must_use]
	pub fn request_timeout(&self) -> Option<Duration> {
		(self.request_timeout_ms != 0).then(|| Duration::from_millis(self.request_timeout_ms))
	}
}

impl Default for ConnectOptions {
	fn default() -> Self {
		Self {
			max_ops_invoked: 1,
			max_ops_performed: 1,
			max_pdu_len_rcv: 16384,
			max_pdu_len_snd: 16384,
			pack_pdv: true,
			backlog: 50,
			tcp_no_delay: true,
			snd_buf: 0,
			rcv_buf: 0,
			close_delay_ms: 0,
			connect_timeout_ms: 5_000,
			request_timeout_ms: 30_000,
			accept_timeout_ms: 5_000,
			release_timeout_ms: 5_000,
			response_timeout_ms: 30_000,
			retrieve_timeout_ms: 60_000,
			idle_timeout_ms: 15_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EditorConfig {
	#[serde(default)]
	pub generate_uids: bool,
	#[serde(default)]
	pub session_key: Option<String>,
	/// Tag (as `"GGGG,EEEE"` hex) to override-string-value map, applied
	/// overwrite-if-present after UID regeneration.
	#[serde(default)]
	pub tag_to_override: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum DestinationConfig {
	Dicom {
		name: String,
		called_aet: String,
		hostname: String,
		port: u16,
		#[serde(default)]
		editors: Vec<EditorConfig>,
		#[serde(default)]
		use_jpeg_destination: bool,
	},
	Web {
		name: String,
		endpoint_url: String,
		#[serde(default = "default_content_type")]
		content_type: String,
		#[serde(default)]
		editors: Vec<EditorConfig>,
	},
}

fn default_content_type() -> String {
	String::from("application/dicom")
}

impl DestinationConfig {
	pub fn name(&self) -> &str {
		match self {
			Self::Dicom { name, .. } | Self::Web { name, .. } => name,
		}
	}
}

/// One Association Registry entry: which destinations a given
/// source peer's instances are fanned out to.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouteConfig {
	pub source_aet: String,
	#[serde(default)]
	pub source_hostname: Option<String>,
	pub destinations: Vec<String>,
}
