mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cw_core::config::Config;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// cronwarden CLI -- schedule agent instructions on cron expressions.
#[derive(Parser)]
#[command(name = "cw", version, about)]
struct Cli {
    /// Emit diagnostics as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status (default when no subcommand is given).
    Status,

    /// Start the background daemon.
    Start {
        /// Run attached to this terminal instead of detaching.
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon and wait for it to exit.
    Stop,

    /// Register a new scheduled task.
    Add {
        /// Five-field cron expression, e.g. "*/15 * * * *".
        cron: String,
        /// Path of the instructions handed to the agent.
        instructions: String,
    },

    /// Delete a task by id.
    Remove {
        /// Task id as shown by `cw list`.
        id: String,
    },

    /// List registered tasks.
    List,

    /// Register the daemon to start at login.
    Install,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load().context("failed to load configuration")?;
    if cli.json_logs || config.logging.json {
        cw_telemetry::logging::init_logging_json("cw", "warn");
    } else {
        cw_telemetry::logging::init_logging("cw", "warn");
    }

    match cli.command {
        None | Some(Commands::Status) => commands::daemon::status(&config)?,
        Some(Commands::Start { foreground }) => commands::daemon::start(&config, foreground).await?,
        Some(Commands::Stop) => commands::daemon::stop(&config).await?,
        Some(Commands::Add { cron, instructions }) => {
            let task = commands::tasks::add(&config, &cron, &instructions)?;
            println!("added {}", task.id);
            println!("  next run: {}", commands::format_epoch(task.next_run));
        }
        Some(Commands::Remove { id }) => {
            commands::tasks::remove(&config, &id)?;
            println!("removed {id}");
        }
        Some(Commands::List) => {
            let tasks = commands::tasks::list(&config)?;
            print!("{}", commands::tasks::render(&tasks));
        }
        Some(Commands::Install) => commands::daemon::install(&config)?,
    }

    Ok(())
}
