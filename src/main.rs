use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use surgical_volume_analytics::aggregate::{aggregate, periods, series_through};
use surgical_volume_analytics::forecast::{forecast_with, project_fiscal_year};
use surgical_volume_analytics::ingest::ingest_csv;
use surgical_volume_analytics::models::FiscalYearProjection;
use surgical_volume_analytics::ranking::rank;
use surgical_volume_analytics::report::build_report;
use surgical_volume_analytics::scorecard::weekly_scorecard;
use surgical_volume_analytics::surgeon::{leaderboards_by_department, surgeon_leaderboard};
use surgical_volume_analytics::{
    load_settings, Aggregates, CaseRecord, DimensionId, DimensionKind, Forecast, Granularity,
    PgSnapshotStore, Settings, SnapshotStore, TargetStatus,
};

#[derive(Parser)]
#[command(name = "surgical-ops")]
#[command(about = "Surgical volume rankings, forecasts and target tracking", long_about = None)]
struct Cli {
    /// Settings file; defaults to ./surgical-ops.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

/// Where aggregates come from: a case CSV or a stored snapshot.
#[derive(Args)]
#[command(group(
    ArgGroup::new("source")
        .args(["csv", "snapshot"])
        .required(true)
        .multiple(false)
))]
struct Source {
    #[arg(long)]
    csv: Option<PathBuf>,
    #[arg(long)]
    snapshot: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the snapshot schema
    InitDb,
    /// Aggregate a case CSV and store it as a snapshot
    Import {
        #[arg(long)]
        csv: PathBuf,
        /// Snapshot key; defaults to the latest case date
        #[arg(long)]
        stamp: Option<String>,
    },
    /// Rank hospitals, departments or surgeons for one period
    Rank {
        #[command(flatten)]
        source: Source,
        #[arg(long, default_value = "department")]
        dimension: DimensionKind,
        #[arg(long, default_value = "week")]
        granularity: Granularity,
        /// Any date inside the period; defaults to the latest period
        #[arg(long)]
        period: Option<NaiveDate>,
        #[arg(long)]
        metric: Option<String>,
    },
    /// Surgeon leaderboards, per department or hospital-wide
    #[command(group(
        ArgGroup::new("scope")
            .args(["department", "by_department"])
            .multiple(false)
    ))]
    Surgeons {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        by_department: bool,
        #[arg(long, default_value = "week")]
        granularity: Granularity,
        #[arg(long)]
        period: Option<NaiveDate>,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Forecast one dimension's volume
    Forecast {
        #[command(flatten)]
        source: Source,
        #[arg(long, default_value = "hospital")]
        dimension: DimensionKind,
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "month")]
        granularity: Granularity,
        #[arg(long, default_value_t = 6)]
        horizon: usize,
        #[arg(long)]
        metric: Option<String>,
    },
    /// Classify actuals against configured targets
    Targets {
        #[command(flatten)]
        source: Source,
        #[arg(long, default_value = "department")]
        dimension: DimensionKind,
        #[arg(long, default_value = "week")]
        granularity: Granularity,
        #[arg(long)]
        period: Option<NaiveDate>,
        #[arg(long)]
        metric: Option<String>,
    },
    /// Weekly department scorecard
    Scorecard {
        #[command(flatten)]
        source: Source,
        /// Any date inside the last week to score; defaults to the latest week
        #[arg(long)]
        week: Option<NaiveDate>,
        #[arg(long)]
        weeks: Option<usize>,
        #[arg(long)]
        metric: Option<String>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        csv: PathBuf,
        /// Defaults to the latest case date
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long, default_value_t = 4)]
        horizon: usize,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref()).context("invalid settings")?;

    match cli.command {
        Commands::InitDb => {
            let store = connect().await?;
            store.migrate().await?;
            println!("Schema ready.");
        }
        Commands::Import { csv, stamp } => {
            let records = read_cases(&csv)?;
            let Some(latest) = records.iter().map(|record| record.date).max() else {
                println!("No valid cases in {}.", csv.display());
                return Ok(());
            };
            let stamp = stamp.unwrap_or_else(|| latest.to_string());

            let mut aggregates = Aggregates::new();
            for granularity in [
                Granularity::Day,
                Granularity::Week,
                Granularity::Month,
                Granularity::FiscalYear,
            ] {
                aggregates.extend(aggregate(&records, granularity, &settings.fiscal)?);
            }

            let store = connect().await?;
            store.put(&stamp, &aggregates).await?;
            println!(
                "Stored {} aggregates from {} cases as snapshot {stamp}.",
                aggregates.len(),
                records.len()
            );
        }
        Commands::Rank {
            source,
            dimension,
            granularity,
            period,
            metric,
        } => {
            let metric = settings.metric(metric_name(&metric, &settings))?;
            let aggregates = load_aggregates(&source, granularity, &settings).await?;
            let Some(period) = period.or_else(|| periods(&aggregates, dimension, granularity).pop())
            else {
                println!("No {dimension} data to rank.");
                return Ok(());
            };
            let entries = rank(
                &aggregates,
                dimension,
                granularity,
                period,
                metric.as_ref(),
                &settings.fiscal,
            )?;
            print_json(&entries)?;
        }
        Commands::Surgeons {
            csv,
            department,
            by_department,
            granularity,
            period,
            metric,
            limit,
        } => {
            let metric = settings.metric(metric_name(&metric, &settings))?;
            let records = read_cases(&csv)?;
            let Some(period) = period.or_else(|| records.iter().map(|record| record.date).max())
            else {
                println!("No valid cases in {}.", csv.display());
                return Ok(());
            };
            let limit = limit.or(settings.ranking.leaderboard_limit);

            if by_department {
                let boards = leaderboards_by_department(
                    &records,
                    granularity,
                    period,
                    metric.as_ref(),
                    &settings.fiscal,
                    limit,
                )?;
                print_json(&boards)?;
            } else {
                let board = surgeon_leaderboard(
                    &records,
                    department.as_deref(),
                    granularity,
                    period,
                    metric.as_ref(),
                    &settings.fiscal,
                    limit,
                )?;
                print_json(&board)?;
            }
        }
        Commands::Forecast {
            source,
            dimension,
            id,
            granularity,
            horizon,
            metric,
        } => {
            #[derive(Serialize)]
            struct ForecastOutput {
                forecast: Forecast,
                projection: FiscalYearProjection,
                targets: Vec<TargetStatus>,
            }

            let metric = settings.metric(metric_name(&metric, &settings))?;
            let aggregates = load_aggregates(&source, granularity, &settings).await?;
            let Some(latest) = periods(&aggregates, dimension, granularity).pop() else {
                println!("No {dimension} data to forecast.");
                return Ok(());
            };
            let dimension = DimensionId::new(dimension, id);
            let history =
                series_through(&aggregates, &dimension, granularity, latest, &settings.fiscal)?;
            let forecast = forecast_with(
                &history,
                horizon,
                &settings.fiscal,
                &settings.forecast,
                metric.as_ref(),
            )
            .with_context(|| format!("cannot forecast {dimension}"))?;
            let projection = project_fiscal_year(
                &history,
                &settings.fiscal,
                &settings.forecast,
                metric.as_ref(),
            )?;
            let targets = settings
                .target_book()?
                .evaluate_forecast(&forecast, metric.name());
            print_json(&ForecastOutput {
                forecast,
                projection,
                targets,
            })?;
        }
        Commands::Targets {
            source,
            dimension,
            granularity,
            period,
            metric,
        } => {
            let metric = settings.metric(metric_name(&metric, &settings))?;
            let targets = settings.target_book()?;
            let aggregates = load_aggregates(&source, granularity, &settings).await?;
            let Some(period) = period.or_else(|| periods(&aggregates, dimension, granularity).pop())
            else {
                println!("No {dimension} data to evaluate.");
                return Ok(());
            };
            let entries = rank(
                &aggregates,
                dimension,
                granularity,
                period,
                metric.as_ref(),
                &settings.fiscal,
            )?;
            print_json(&targets.evaluate_ranking(&entries, metric.name()))?;
        }
        Commands::Scorecard {
            source,
            week,
            weeks,
            metric,
        } => {
            let metric = settings.metric(metric_name(&metric, &settings))?;
            let targets = settings.target_book()?;
            let aggregates = load_aggregates(&source, Granularity::Week, &settings).await?;
            let Some(week) = week.or_else(|| {
                periods(&aggregates, DimensionKind::Department, Granularity::Week).pop()
            }) else {
                println!("No department data to score.");
                return Ok(());
            };
            let scores = weekly_scorecard(
                &aggregates,
                &targets,
                metric.as_ref(),
                week,
                weeks.unwrap_or(settings.ranking.scorecard_weeks),
                &settings.fiscal,
            )?;
            print_json(&scores)?;
        }
        Commands::Report {
            csv,
            as_of,
            horizon,
            metric,
            out,
        } => {
            let metric = settings.metric(metric_name(&metric, &settings))?;
            let targets = settings.target_book()?;
            let records = read_cases(&csv)?;
            let Some(as_of) = as_of.or_else(|| records.iter().map(|record| record.date).max())
            else {
                println!("No valid cases in {}.", csv.display());
                return Ok(());
            };
            let report = build_report(
                &records,
                as_of,
                horizon,
                &settings,
                &targets,
                metric.as_ref(),
            )?;
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn metric_name<'a>(requested: &'a Option<String>, settings: &'a Settings) -> &'a str {
    requested
        .as_deref()
        .unwrap_or(settings.ranking.default_metric.as_str())
}

async fn connect() -> anyhow::Result<PgSnapshotStore> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(PgSnapshotStore::new(pool))
}

fn read_cases(path: &Path) -> anyhow::Result<Vec<CaseRecord>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let outcome = ingest_csv(file);
    if outcome.dropped() > 0 || outcome.duplicates > 0 {
        eprintln!(
            "Skipped {} malformed rows and replaced {} duplicate cases from {}.",
            outcome.rejected.len(),
            outcome.duplicates,
            path.display()
        );
    }
    Ok(outcome.records)
}

async fn load_aggregates(
    source: &Source,
    granularity: Granularity,
    settings: &Settings,
) -> anyhow::Result<Aggregates> {
    if let Some(path) = &source.csv {
        let records = read_cases(path)?;
        return Ok(aggregate(&records, granularity, &settings.fiscal)?);
    }

    let stamp = source
        .snapshot
        .as_deref()
        .context("either --csv or --snapshot is required")?;
    let store = connect().await?;
    store
        .get(stamp)
        .await?
        .with_context(|| format!("no snapshot stored under {stamp}"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
