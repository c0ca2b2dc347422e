// Stipend Ledger - command line
//
// Operator tool for the ledger database: seeding the calendar, registering
// practices, running imports and exporting CSV.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::str::FromStr;
use stipend_ledger::config::{CONFIG_PATH_ENV, DB_PATH_ENV};
use stipend_ledger::{Actor, EngineConfig, PeriodRef, RequestStatus, Role, StipendEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stipend-ledger", version, about = "Practice stipend ledger")]
struct Cli {
    /// JSON config file
    #[arg(long, env = CONFIG_PATH_ENV, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (overrides the config file)
    #[arg(long, env = DB_PATH_ENV, global = true)]
    db: Option<String>,

    /// Operator id recorded in the audit trail
    #[arg(long, default_value = "cli", global = true)]
    user: String,

    #[arg(long, default_value = "admin", global = true)]
    role: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the schema and seed configured years
    Init,
    /// Generate the pay periods of a year
    SeedYear { year: i32 },
    /// Make (period, year) the current pay period
    SetCurrent { period: u32, year: i32 },
    AddPortfolio { id: String, name: String },
    AddPractice {
        id: String,
        name: String,
        #[arg(long)]
        portfolio: String,
    },
    /// Import practice metrics for the current period
    ImportMetrics { csv: PathBuf },
    /// Backfill historical payments as opening balances
    ImportOpening { csv: PathBuf },
    /// Show a practice balance
    Balance {
        practice: String,
        #[arg(long, requires = "year")]
        period: Option<u32>,
        #[arg(long, requires = "period")]
        year: Option<i32>,
    },
    ExportLedger {
        #[arg(long)]
        year: Option<i32>,
        /// Output file (stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    ExportRequests {
        #[arg(long)]
        practice: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn output(path: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(File::create(p).with_context(|| format!("creating {}", p.display()))?),
        None => Box::new(io::stdout()),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stipend_ledger=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let role = Role::from_str(&cli.role)?;
    let actor = Actor::new(&cli.user, &format!("{}@localhost", cli.user), role);
    let engine = StipendEngine::open(config)?;

    match &cli.command {
        Command::Init => {
            println!("✓ Database ready: {}", engine.config().database_path);
        }
        Command::SeedYear { year } => {
            let created = engine.seed_year(&actor, *year)?;
            println!("✓ Seeded {} pay periods for {}", created, year);
        }
        Command::SetCurrent { period, year } => {
            let row = engine.set_current_period(&actor, PeriodRef::new(*period, *year))?;
            println!(
                "✓ Current pay period: {} ({} to {})",
                row.period_ref(),
                row.start_date,
                row.end_date
            );
        }
        Command::AddPortfolio { id, name } => {
            engine.create_portfolio(&actor, id, name)?;
            println!("✓ Portfolio {} created", id);
        }
        Command::AddPractice { id, name, portfolio } => {
            engine.create_practice(&actor, id, name, portfolio)?;
            println!("✓ Practice {} created in {}", id, portfolio);
        }
        Command::ImportMetrics { csv } => {
            let file = File::open(csv).with_context(|| format!("opening {}", csv.display()))?;
            let summary = engine.import_metrics_csv(&actor, BufReader::new(file))?;
            println!("📥 Metrics import");
            println!("   imported:          {}", summary.imported);
            println!("   opening balances:  {}", summary.opening_balances);
            println!("   remeasurements:    {}", summary.remeasurements);
            println!("   unchanged:         {}", summary.unchanged);
            for failure in &summary.failures {
                println!("   ❌ row {} {}: {}", failure.row, failure.practice_id, failure.reason);
            }
            if summary.remeasurement_completed {
                println!("✓ Remeasurement completed for the current period");
            }
        }
        Command::ImportOpening { csv } => {
            let file = File::open(csv).with_context(|| format!("opening {}", csv.display()))?;
            let summary = engine.import_opening_balances_csv(&actor, BufReader::new(file))?;
            println!("📥 Opening balances: {} created, {} skipped", summary.created, summary.skipped);
            for practice in &summary.unknown_practices {
                println!("   ⚠️  unknown practice {}", practice);
            }
            for failure in &summary.failures {
                println!("   ❌ row {}: {}", failure.row, failure.reason);
            }
        }
        Command::Balance { practice, period, year } => {
            let as_of = match (period, year) {
                (Some(p), Some(y)) => Some(PeriodRef::new(*p, *y)),
                _ => None,
            };
            let balance = engine.balance(practice, as_of)?;
            println!("💰 {} as of {}", balance.practice_id, balance.as_of);
            println!("   cap:          {}", balance.stipend_cap);
            println!("   paid:         {}", balance.stipend_paid);
            println!("   committed:    {}", balance.stipend_committed);
            println!("   allocated in: {}", balance.allocated_in);
            println!("   allocated out:{}", balance.allocated_out);
            println!("   available:    {}", balance.available_balance);
            println!(
                "   per period:   {} ({} remaining)",
                balance.available_per_pp, balance.remaining_periods
            );
            println!("   utilization:  {}%", balance.utilization_percent);
        }
        Command::ExportLedger { year, out } => {
            let rows = engine.export_ledger(output(out)?, *year)?;
            eprintln!("✓ Exported {} ledger entries", rows);
        }
        Command::ExportRequests { practice, status, out } => {
            let status = status.as_deref().map(RequestStatus::from_str).transpose()?;
            let rows = engine.export_requests(output(out)?, practice.as_deref(), status)?;
            eprintln!("✓ Exported {} requests", rows);
        }
    }

    Ok(())
}
