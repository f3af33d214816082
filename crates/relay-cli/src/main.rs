mod commands;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use commands::load_payload;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Outbox/inbox/scheduler/lease operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> engine -> ...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Outbox operator commands
    Outbox {
        #[command(subcommand)]
        cmd: OutboxCmd,
    },

    /// Inbox operator commands
    Inbox {
        #[command(subcommand)]
        cmd: InboxCmd,
    },

    /// Scheduler operator commands (jobs + one-shot timers)
    Scheduler {
        #[command(subcommand)]
        cmd: SchedulerCmd,
    },

    /// Distributed lease inspection
    Lease {
        #[command(subcommand)]
        cmd: LeaseCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum OutboxCmd {
    /// Enqueue a message for dispatch.
    Enqueue {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long = "payload-file")]
        payload_file: Option<String>,
        #[arg(long)]
        correlation_id: Option<Uuid>,
        #[arg(long)]
        due_time_utc: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand)]
enum InboxCmd {
    /// Enqueue an inbound message (idempotent on source + message_id).
    Enqueue {
        #[arg(long)]
        source: String,
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long = "payload-file")]
        payload_file: Option<String>,
        #[arg(long)]
        hash: Option<String>,
        #[arg(long)]
        due_time_utc: Option<DateTime<Utc>>,
    },
    /// Revive a dead-lettered row back to Seen.
    Revive {
        #[arg(long)]
        source: String,
        #[arg(long)]
        message_id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value_t = 0)]
        delay_seconds: i64,
    },
}

#[derive(Subcommand)]
enum SchedulerCmd {
    /// Create or update a cron-scheduled job.
    Job {
        #[arg(long)]
        name: String,
        #[arg(long)]
        topic: String,
        #[arg(long)]
        cron: String,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long = "payload-file")]
        payload_file: Option<String>,
    },
    /// Trigger an immediate out-of-band run for a job.
    Trigger {
        #[arg(long)]
        name: String,
    },
    /// Schedule a one-shot timer.
    Timer {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: Option<String>,
        #[arg(long = "payload-file")]
        payload_file: Option<String>,
        #[arg(long)]
        due_time_utc: DateTime<Utc>,
        #[arg(long)]
        correlation_id: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum LeaseCmd {
    /// Read the current state of a lease resource without acquiring it.
    Status {
        #[arg(long)]
        resource: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = relay_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = relay_db::status(&pool).await?;
                    println!("db_ok={} has_core_tables={}", s.ok, s.has_core_tables);
                }
                DbCmd::Migrate => {
                    relay_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = relay_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Outbox { cmd } => {
            let pool = relay_db::connect_from_env().await?;
            match cmd {
                OutboxCmd::Enqueue { topic, message_id, payload, payload_file, correlation_id, due_time_utc } => {
                    let payload = load_payload(payload, payload_file)?;
                    commands::outbox::enqueue(&pool, &topic, &message_id, payload, correlation_id, due_time_utc).await?;
                }
            }
        }

        Commands::Inbox { cmd } => {
            let pool = relay_db::connect_from_env().await?;
            match cmd {
                InboxCmd::Enqueue { source, message_id, topic, payload, payload_file, hash, due_time_utc } => {
                    let payload = load_payload(payload, payload_file)?;
                    commands::inbox::enqueue(&pool, &source, &message_id, &topic, payload, hash, due_time_utc).await?;
                }
                InboxCmd::Revive { source, message_id, reason, delay_seconds } => {
                    commands::inbox::revive(&pool, &source, &message_id, reason, delay_seconds).await?;
                }
            }
        }

        Commands::Scheduler { cmd } => {
            let pool = relay_db::connect_from_env().await?;
            match cmd {
                SchedulerCmd::Job { name, topic, cron, payload, payload_file } => {
                    let payload = match (payload, payload_file) {
                        (None, None) => None,
                        (p, f) => Some(load_payload(p, f)?),
                    };
                    commands::jobs::create_or_update(&pool, &name, &topic, &cron, payload).await?;
                }
                SchedulerCmd::Trigger { name } => {
                    commands::jobs::trigger(&pool, &name).await?;
                }
                SchedulerCmd::Timer { topic, payload, payload_file, due_time_utc, correlation_id } => {
                    let payload = load_payload(payload, payload_file)?;
                    commands::timers::schedule(&pool, &topic, payload, due_time_utc, correlation_id).await?;
                }
            }
        }

        Commands::Lease { cmd } => {
            let pool = relay_db::connect_from_env().await?;
            match cmd {
                LeaseCmd::Status { resource } => {
                    commands::lease::status(&pool, &resource).await?;
                }
            }
        }
    }

    Ok(())
}
