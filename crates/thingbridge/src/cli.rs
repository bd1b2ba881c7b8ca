//! Clap derive structures for the `thingbridge` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// thingbridge -- forward thing property changes to an IoT hub
#[derive(Debug, Parser)]
#[command(
    name = "thingbridge",
    version,
    about = "Forward WebThings property changes to an IoT hub",
    long_about = "Bridges a WebThings gateway to an IoT hub.\n\n\
        Every thing becomes a hub device identity, provisioned on first\n\
        contact. Property changes are coalesced per device and sent as\n\
        telemetry events and, optionally, reported twin properties.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (default: platform config directory)
    #[arg(long, short = 'C', env = "THINGBRIDGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "THINGBRIDGE_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Also write logs to this file, rotated daily
    #[arg(long, env = "THINGBRIDGE_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    /// Accept self-signed TLS certificates from the gateway
    #[arg(long, short = 'k', global = true)]
    pub insecure: bool,

    /// Network timeout in seconds (overrides config)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

// ── Enums ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge until interrupted
    Run(RunArgs),

    /// List device identities registered in the hub
    #[command(alias = "ids")]
    Identities(IdentitiesArgs),

    /// Inspect configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Also apply every batch to the device twin (overrides config)
    #[arg(long)]
    pub update_twin: bool,

    /// Keep newly provisioned keys in memory instead of the config file
    #[arg(long)]
    pub ephemeral_keys: bool,
}

#[derive(Debug, Args)]
pub struct IdentitiesArgs {
    /// Maximum number of identities to list
    #[arg(long, default_value = "1000")]
    pub top: usize,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file path
    Path,

    /// Show the effective configuration (secrets redacted)
    Show,

    /// Store a secret in the system keyring, read from stdin
    SetSecret {
        /// Which secret to store
        name: SecretName,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SecretName {
    /// Hub connection string
    HubConnectionString,
    /// Gateway access token
    AccessToken,
}

impl SecretName {
    /// Keyring entry name.
    pub fn entry(self) -> &'static str {
        match self {
            Self::HubConnectionString => "hub-connection-string",
            Self::AccessToken => "access-token",
        }
    }
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
