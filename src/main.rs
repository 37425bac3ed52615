//! nvstack - Layered non-volatile memory driver stack
//!
//! The tool assembles the driver stack described by a stack file over a
//! simulated internal flash backed by an image file. Partitions can then be
//! read, written, erased and flushed through their full driver chains, so a
//! cached or encrypted partition behaves exactly as it would on the target.
//!
//! # Architecture
//!
//! - **Partition table** - named partitions, each with its own driver chain
//! - **Cache layer** - RAM copy guarded by a CRC-16 trailer
//! - **Encryption layer** - AES-128-CBC over fixed windows
//! - **Pre-erase layer** - erases each sector as sequential writes reach it
//! - **Internal flash** - sector read-modify-write over a command engine

mod cli;
mod commands;
mod stack;

use clap::Parser;
use cli::{Cli, Commands};
use nvstack_core::StackConfig;
use stack::Stack;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let config = match StackConfig::from_toml_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load stack file {:?}: {}", cli.config, e);
            std::process::exit(1);
        }
    };

    log::info!(
        "Loaded {} partitions from {:?}",
        config.partitions.len(),
        cli.config
    );

    let result = match cli.command {
        Commands::Validate => commands::info::cmd_validate(&config),
        command => {
            let stack = Stack::open(&config)?;
            run(&config, &stack, command)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn run(config: &StackConfig, stack: &Stack, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Info => {
            commands::info::cmd_info(config, stack);
            Ok(())
        }
        Commands::Validate => commands::info::cmd_validate(config),
        Commands::Read {
            partition,
            output,
            offset,
            length,
        } => commands::partition::run_read(stack, &partition, &output, offset, length),
        Commands::Write {
            partition,
            input,
            offset,
            verify,
        } => commands::partition::run_write(stack, &partition, &input, offset, verify),
        Commands::Erase {
            partition,
            offset,
            length,
        } => commands::partition::run_erase(stack, &partition, offset, length),
        Commands::Restore { partition } => commands::partition::run_restore(stack, &partition),
        Commands::Flush => commands::partition::run_flush(stack),
        Commands::Swap { action, partition } => {
            commands::swap::run_swap(stack, action.into(), partition.as_deref())
        }
        Commands::ReadOnce { index, partition } => {
            commands::swap::run_read_once(stack, index, partition.as_deref())
        }
    }
}
