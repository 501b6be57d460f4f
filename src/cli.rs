//! CLI surface: a `listen` command
//! that runs the proxy, and a one-shot `send` command for ad-hoc
//! forwarding/testing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dicom-forward", version, about = "DICOM store-and-forward proxy")]
pub struct Cli {
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Bind the inbound C-STORE SCP and forward every received instance to
	/// the configured destinations until terminated.
	Listen {
		#[arg(long, default_value = "config.toml")]
		config: PathBuf,
	},
	/// Forward a single file (or directory of files) to one destination,
	/// without opening an inbound association.
	Send {
		/// Destination AET / hostname:port, e.g. `REMOTE@10.0.0.2:104`.
		#[arg(long)]
		destination: String,
		files: Vec<PathBuf>,
	},
}

/// Process exit codes: `0` success, `1` configuration error,
/// `2` network error, `3` one or more per-instance failures occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
	Success = 0,
	ConfigError = 1,
	NetworkError = 2,
	PartialFailure = 3,
}
