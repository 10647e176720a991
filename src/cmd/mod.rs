//! Daemon commands.

pub mod diagnostics;
pub mod root;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Check the host for required binaries and capabilities
    Diagnostics,
}
