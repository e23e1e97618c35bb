use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "strongbox",
    about = "Envelope-encrypted settings store",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the decrypted value of a setting.
    Get { key: String },
    /// Store a setting and commit.
    Set { key: String, value: String },
    /// Remove a setting and commit.
    Remove { key: String },
    /// List visible setting names.
    List,
    /// Re-encrypt every setting under a new data key and key pair.
    Rotate {
        /// Target key container; generated when omitted.
        #[arg(long, value_name = "NAME")]
        to: Option<String>,
        /// Leave the previous key pair in place after a successful rotation.
        #[arg(long)]
        keep_previous: bool,
    },
    /// Delete the active key pair. Protected settings become unreadable.
    DeleteKey,
    /// Run a set/get/remove round trip against the configured store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
