//! # CLI Interface
//!
//! Defines the command-line argument structure for `parley-node` using
//! `clap` derive. Supports four subcommands: `init`, `pubkey`, `demo`,
//! and `version`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Parley peer node.
///
/// Manages the local identity key and runs a two-node loopback demo of the
/// encrypted messaging, file transfer and trade negotiation stack.
#[derive(Parser, Debug)]
#[command(
    name = "parley-node",
    about = "Parley peer node",
    version,
    propagate_version = true
)]
pub struct ParleyNodeCli {
    /// Log output format: `pretty` or `json`.
    #[arg(long, global = true, env = "PARLEY_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Default filter directives when `RUST_LOG` is unset.
    #[arg(
        long,
        global = true,
        env = "PARLEY_LOG_LEVEL",
        default_value = "parley_node=info,parley_protocol=info"
    )]
    pub log_level: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the Parley node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory and generate (or load) the identity key.
    Init(InitArgs),
    /// Print the exported public key of an initialized node.
    Pubkey(StoreArgs),
    /// Run two nodes over the in-memory network, send a file and settle a
    /// trade between them, then print metrics.
    Demo(DemoArgs),
    /// Print version information and exit.
    Version,
}

/// Location of the key store and the optional JSON config.
#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Node data directory. The identity lives in `<data-dir>/keys`.
    #[arg(long, short = 'd', env = "PARLEY_DATA_DIR", default_value = ".parley")]
    pub data_dir: PathBuf,

    /// Path to a JSON node configuration. Missing fields take defaults.
    #[arg(long, short = 'c', env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Arguments for the `init` subcommand.
#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Replace an existing identity with a freshly generated one.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `demo` subcommand.
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Path to a JSON node configuration applied to both demo nodes.
    #[arg(long, short = 'c', env = "PARLEY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Size in bytes of the generated file sent from alice to bob.
    #[arg(long, default_value_t = 40_000)]
    pub file_size: usize,

    /// Seconds to wait for each demo step before giving up.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        ParleyNodeCli::command().debug_assert();
    }

    #[test]
    fn test_parses_demo_with_overrides() {
        let cli = ParleyNodeCli::try_parse_from([
            "parley-node",
            "--log-format",
            "json",
            "demo",
            "--file-size",
            "1024",
        ])
        .unwrap();
        assert_eq!(cli.log_format, "json");
        match cli.command {
            Commands::Demo(args) => {
                assert_eq!(args.file_size, 1024);
                assert_eq!(args.timeout_secs, 10);
                assert!(args.config.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parses_init_force() {
        let cli =
            ParleyNodeCli::try_parse_from(["parley-node", "init", "-d", "/tmp/p", "--force"])
                .unwrap();
        match cli.command {
            Commands::Init(args) => {
                assert!(args.force);
                assert_eq!(args.store.data_dir, PathBuf::from("/tmp/p"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
