//! CLI argument parsing

use clap::{Parser, Subcommand, ValueEnum};
use nvstack_core::partition::config::parse_number;
use nvstack_core::SwapCommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nvstack")]
#[command(author, version, about = "Partitioned flash storage stack tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Stack description (TOML)
    #[arg(short, long, global = true, default_value = "stack.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Bank swap steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SwapAction {
    /// Initialise the swap system
    Init,
    /// Start an update of the inactive bank
    Update,
    /// Commit the swap; it takes effect at the next reset
    Complete,
    /// Report the swap state
    Status,
}

impl From<SwapAction> for SwapCommand {
    fn from(action: SwapAction) -> Self {
        match action {
            SwapAction::Init => SwapCommand::Init,
            SwapAction::Update => SwapCommand::Update,
            SwapAction::Complete => SwapCommand::Complete,
            SwapAction::Status => SwapCommand::GetStatus,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the device and partition table
    Info,

    /// Check the stack file and partition table without touching the image
    Validate,

    /// Read partition contents to a file
    Read {
        /// Partition name
        partition: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Start offset within the partition
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u32,

        /// Number of bytes (default: to the end of the partition)
        #[arg(long, value_parser = parse_number)]
        length: Option<u32>,
    },

    /// Write a file into a partition
    Write {
        /// Partition name
        partition: String,

        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Start offset within the partition
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u32,

        /// Read back and compare after writing
        #[arg(long)]
        verify: bool,
    },

    /// Erase part or all of a partition
    Erase {
        /// Partition name
        partition: String,

        /// Start offset within the partition
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u32,

        /// Number of bytes (default: to the end of the partition)
        #[arg(long, value_parser = parse_number)]
        length: Option<u32>,
    },

    /// Reload a partition's buffered contents from the medium
    Restore {
        /// Partition name
        partition: String,
    },

    /// Flush every partition to the medium
    Flush,

    /// Drive the dual-bank swap
    Swap {
        /// Swap step
        #[arg(value_enum)]
        action: SwapAction,

        /// Internal flash partition to address (default: first one)
        #[arg(short, long)]
        partition: Option<String>,
    },

    /// Read a program-once record
    ReadOnce {
        /// Record index
        index: u8,

        /// Internal flash partition to address (default: first one)
        #[arg(short, long)]
        partition: Option<String>,
    },
}
