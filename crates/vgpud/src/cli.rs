use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use vgpuconfig::BackendKind;

#[derive(Parser, Debug)]
#[command(
    name = "vgpud",
    author,
    version,
    about = "Virtual GPU server for virgl clients",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub overrides: Overrides,
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Settings that take precedence over the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Configuration file to load instead of the per-user default.
    #[arg(long, value_name = "FILE", env = "VGPUD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Unix socket path to listen on.
    #[arg(long, value_name = "PATH", env = "VGPUD_SOCKET", global = true)]
    pub socket: Option<PathBuf>,

    /// Rendering backend (`wgpu` or `null`).
    #[arg(long, value_name = "KIND", value_parser = parse_backend, global = true)]
    pub backend: Option<BackendKind>,

    /// Maximum number of clients served at once.
    #[arg(long, value_name = "N", global = true)]
    pub max_connections: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen for clients (the default when no subcommand is given).
    Serve,
    /// Print the capability set the selected backend advertises.
    Caps(CapsArgs),
    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct CapsArgs {
    /// Emit the full capability set as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_backend(value: &str) -> Result<BackendKind, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
        "null" | "none" => Ok(BackendKind::Null),
        other => Err(format!("unknown backend '{other}'; use wgpu or null")),
    }
}
