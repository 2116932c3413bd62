// External crates
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Internal imports
use ws_ports::{PortAllocator, PortRange};

#[derive(Parser)]
#[command(name = "ws-ports")]
#[command(about = "Inspect and repair workspace port allocations")]
#[command(version)]
pub struct Args {
    /// Path to the port registry file
    #[arg(long, env = "WS_PORT_REGISTRY", default_value = "/var/lib/ws-engine/ports.json")]
    pub registry: PathBuf,

    /// Port range managed by the registry (e.g. "20000-20999")
    #[arg(long, env = "WS_PORT_RANGE", default_value = "20000-20999")]
    pub range: PortRange,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Allocate the lowest free port on a host
    Allocate {
        /// Host identifier
        host: String,
        /// Label recorded as the holder (usually a workspace id)
        holder: String,
    },
    /// Release a port on a host
    Release { host: String, port: u16 },
    /// List allocations on a host
    List { host: String },
    /// Check whether a range overlaps the managed range
    Check {
        /// Port range (e.g. "3000-3009")
        range: PortRange,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let allocator = PortAllocator::new(args.range, &args.registry);

    match args.command {
        Command::Allocate { host, holder } => {
            let port = allocator.allocate(&host, &holder)?;
            println!("{}", port);
        }
        Command::Release { host, port } => {
            if allocator.release(&host, port)? {
                println!("✅ Released port {} on '{}'", port, host);
            } else {
                println!("Port {} on '{}' was not allocated", port, host);
            }
        }
        Command::List { host } => {
            let allocations = allocator.allocations(&host)?;
            if allocations.is_empty() {
                println!("No ports allocated on '{}'", host);
            } else {
                println!("Allocated ports on '{}' (range {}):", host, allocator.range());
                for (port, allocation) in allocations {
                    println!("  {}: {}", port, allocation.holder);
                }
            }
        }
        Command::Check { range } => {
            if range.overlaps_with(&allocator.range()) {
                println!(
                    "⚠️  {} overlaps the workspace port range {}",
                    range,
                    allocator.range()
                );
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
