//! strata-ctl - operator tool for the shared mailbox arena.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use strata_config::MboxConfig;
use strata_mbox::{Arena, ComponentId, LAST_ID, MboxError, Mid, SendMode};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Create, inspect and poke the machine-wide mailbox arena.
#[derive(Parser)]
#[command(name = "strata-ctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (built-in defaults otherwise)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the arena and both semaphore sets
    Create,

    /// Destroy the arena and remove its files
    Delete,

    /// Print statistics for every mailbox
    Stats,

    /// Create a mailbox
    Mkbox {
        /// Mailbox id
        #[arg(value_parser = component_id)]
        id: u16,

        /// Owning component (defaults to the mailbox id)
        #[arg(short, long, value_parser = component_id)]
        owner: Option<u16>,

        /// Messages the mailbox holds
        #[arg(short, long, default_value = "16")]
        num_msg: usize,

        /// Maximum message size in bytes
        #[arg(short, long, default_value = "256")]
        msg_size: usize,
    },

    /// Delete a mailbox
    Rmbox {
        #[arg(value_parser = component_id)]
        id: u16,
    },

    /// Send a text message without blocking
    Ping {
        /// Destination mailbox
        #[arg(value_parser = component_id)]
        to: u16,

        text: String,

        /// Sending component
        #[arg(short, long, value_parser = component_id, default_value_t = LAST_ID)]
        from: u16,
    },

    /// Receive and print every queued message
    Drain {
        #[arg(value_parser = component_id)]
        id: u16,
    },
}

fn component_id(s: &str) -> Result<u16, String> {
    let raw: u16 = s.parse().map_err(|e| format!("{e}"))?;
    if ComponentId(raw).is_valid() {
        Ok(raw)
    } else {
        Err(format!("component ids range from 0 to {LAST_ID}"))
    }
}

fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .try_init()
        .context("failed to install tracing subscriber")
}

fn load_config(path: Option<String>) -> Result<MboxConfig> {
    match path {
        Some(path) => MboxConfig::load(path.clone()).with_context(|| format!("loading {path}")),
        None => Ok(MboxConfig::default()),
    }
}

fn map(cfg: &MboxConfig) -> Result<Arena> {
    Arena::map_all(cfg).with_context(|| format!("mapping {}", cfg.arena_path().display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config)?;
    setup_logging(&cfg.log_level)?;

    match cli.command {
        Commands::Create => {
            let arena = Arena::create_all(&cfg)?;
            println!("created {} ({} bytes)", arena.arena_path().display(), cfg.arena_size);
            arena.unmap_all();
        }
        Commands::Delete => {
            map(&cfg)?.delete_all()?;
            info!(arena = %cfg.arena_path().display(), "arena removed");
        }
        Commands::Stats => {
            let arena = map(&cfg)?;
            arena.dump_stats(&mut io::stdout().lock())?;
        }
        Commands::Mkbox {
            id,
            owner,
            num_msg,
            msg_size,
        } => {
            let owner = ComponentId(owner.unwrap_or(id));
            map(&cfg)?.create_mailbox(owner, ComponentId(id), num_msg, msg_size)?;
            info!(mailbox = id, owner = %owner, num_msg, msg_size, "mailbox created");
        }
        Commands::Rmbox { id } => {
            map(&cfg)?.delete_mailbox(ComponentId(id))?;
            info!(mailbox = id, "mailbox removed");
        }
        Commands::Ping { to, text, from } => {
            let arena = map(&cfg)?;
            let from = ComponentId(from);
            match arena.send(from, ComponentId(to), SendMode::NonBlocking, &Mid::local(from), &[text.as_bytes()]) {
                Ok(n) => println!("sent {n} bytes to #{to}"),
                Err(e @ MboxError::NoSpace { .. }) => bail!("mailbox #{to} is full: {e}"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Drain { id } => {
            let arena = map(&cfg)?;
            let id = ComponentId(id);
            let slot_size = arena.mailbox_stats(id)?.slot_size;
            let mut buf = vec![0u8; slot_size];
            let mut out = io::stdout().lock();
            let mut drained = 0usize;
            while let Some((from, n)) = arena.receive(id, &mut buf)? {
                writeln!(out, "{from}: {}", String::from_utf8_lossy(&buf[..n]))?;
                drained += 1;
            }
            writeln!(out, "drained {drained} message(s) from {id}")?;
            info!(mailbox = %id, drained, "drain finished");
        }
    }
    Ok(())
}
