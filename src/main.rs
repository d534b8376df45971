use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use school_indicators::config::Config;
use school_indicators::db::{self, PgBackend};
use school_indicators::models::{Actor, Instrument};
use school_indicators::{import, report, visibility, IndicatorService};

#[derive(Parser)]
#[command(name = "school-indicators")]
#[command(about = "Assessment records and consolidated indicators for a regional school network", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Identity handed over by the session provider.
#[derive(Args)]
struct ActorArgs {
    /// Email of the authenticated account
    #[arg(long = "as")]
    email: String,
    /// Identity-provider subject; defaults to the email
    #[arg(long)]
    subject: Option<String>,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        Actor::new(
            self.subject.clone().unwrap_or_else(|| self.email.clone()),
            self.email.clone(),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo region
    Seed,
    /// Import assessment records of one instrument from a CSV file
    Import {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        instrument: Instrument,
        #[arg(long)]
        csv: PathBuf,
    },
    /// List records of one school and instrument
    Records {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        instrument: Instrument,
    },
    /// Delete a record and recompute its indicators
    Delete {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        id: Uuid,
    },
    /// Recompute every instrument for a school
    Recompute {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long)]
        school: Uuid,
    },
    /// Show the schools an account can see and write
    Scope {
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// List the user profiles an account can see
    Users {
        #[command(flatten)]
        actor: ActorArgs,
    },
    /// Print the append-only audit log (admins only)
    Audit {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Generate a markdown indicators report
    Report {
        #[command(flatten)]
        actor: ActorArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let backend = Arc::new(PgBackend::new(pool.clone()));
    let service = IndicatorService::new(Arc::clone(&backend));

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(backend).await?;
            println!("Seed data inserted (admin: {}).", db::SEED_ADMIN_EMAIL);
        }
        Commands::Import {
            actor,
            instrument,
            csv,
        } => {
            let imported = import::import_csv(&service, &actor.actor(), instrument, &csv).await?;
            println!("Imported {imported} {instrument} records from {}.", csv.display());
        }
        Commands::Records {
            actor,
            school,
            instrument,
        } => {
            let records = service
                .list_records(&actor.actor(), school, instrument)
                .await?;
            if records.is_empty() {
                println!("No {instrument} records visible for this school.");
                return Ok(());
            }
            for stored in records {
                println!(
                    "- {} year {} ({}/{} evaluated) updated {} by {}",
                    stored.id,
                    stored.record.year,
                    stored.record.participation.evaluated,
                    stored.record.participation.expected,
                    stored.updated_at.format("%Y-%m-%d %H:%M"),
                    stored.updated_by
                );
            }
        }
        Commands::Delete { actor, id } => {
            service.delete_record(&actor.actor(), id).await?;
            println!("Record {id} deleted.");
        }
        Commands::Recompute { actor, school } => {
            let school = service.recompute_all(&actor.actor(), school).await?;
            println!("Indicators for {} recomputed:", school.name);
            println!("{}", serde_json::to_string_pretty(&school.indicators)?);
        }
        Commands::Scope { actor } => {
            let actor = actor.actor();
            let scope = service.scope(&actor).await?;
            println!(
                "{} sees {} schools{}",
                actor.email,
                scope.school_ids.len(),
                if scope.can_see_all_users {
                    " and every user"
                } else {
                    ""
                }
            );
            for school in service.list_schools(&actor).await? {
                let writable = service.can_write(&actor, school.id).await?;
                println!(
                    "- {} ({}){}",
                    school.name,
                    school.id,
                    if writable { " [write]" } else { "" }
                );
            }
        }
        Commands::Users { actor } => {
            let actor = actor.actor();
            let users = service.list_users(&actor).await?;
            let me = users
                .iter()
                .find(|user| user.email.eq_ignore_ascii_case(&actor.email))
                .cloned();
            for user in users {
                let shared = me
                    .as_ref()
                    .map(|me| visibility::shared_schools(me, &user).len())
                    .unwrap_or(0);
                println!(
                    "- {} <{}> {} {} ({} shared schools)",
                    user.name,
                    user.email,
                    user.role.as_str(),
                    user.status.as_str(),
                    shared
                );
            }
        }
        Commands::Audit { actor, limit } => {
            let entries = service.audit_log(&actor.actor()).await?;
            for entry in entries.iter().rev().take(limit) {
                println!(
                    "- {} {} {} {} {}",
                    entry.occurred_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.actor,
                    entry.action.as_str(),
                    entry.subject_id,
                    entry.detail
                );
            }
        }
        Commands::Report { actor, out } => {
            let actor = actor.actor();
            let schools = service.list_schools(&actor).await?;
            let report = report::build_report(&actor.email, chrono::Utc::now().date_naive(), &schools);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
