use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use groupscholar_struggle_engine::actor::StruggleEngine;
use groupscholar_struggle_engine::config::EngineConfig;
use groupscholar_struggle_engine::db::{self, PgAlertStore, PgInterventionQueue};
use groupscholar_struggle_engine::hub::BroadcastHub;
use groupscholar_struggle_engine::models::{InteractionEvent, InteractionKind, Sentiment};
use groupscholar_struggle_engine::server;

#[derive(Parser)]
#[command(name = "struggle-engine")]
#[command(about = "Real-time struggle detection for Group Scholar courses", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Run the live detection engine and dashboard feed
    Serve {
        #[arg(long, default_value = "127.0.0.1:9400")]
        bind: SocketAddr,
    },
    /// Replay interaction events from a CSV file through the engine
    Replay {
        #[arg(long)]
        csv: PathBuf,
        /// Pause between replayed events, in milliseconds
        #[arg(long, default_value_t = 0)]
        pace_ms: u64,
    },
    /// List recent instructor alerts
    Alerts {
        #[arg(long)]
        course: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Serve { bind } => {
            let engine = build_engine(EngineConfig::from_env(), pool);
            server::serve(engine, bind).await?;
        }
        Commands::Replay { csv, pace_ms } => {
            let engine = build_engine(EngineConfig::from_env(), pool);
            let (accepted, rejected) = replay_csv(&engine, &csv, pace_ms).await?;
            println!(
                "Replayed {accepted} events ({rejected} rejected) from {}.",
                csv.display()
            );
        }
        Commands::Alerts { course, limit } => {
            let alerts = db::fetch_recent_alerts(&pool, course.as_deref(), limit).await?;
            if alerts.is_empty() {
                println!("No alerts recorded yet.");
                return Ok(());
            }
            println!("Recent instructor alerts:");
            for alert in alerts {
                println!(
                    "- [{}] {} in {} severity {:.2} across {} events ({}, {})",
                    alert.pattern_type.as_str(),
                    alert.student_id,
                    alert.course_id,
                    alert.severity,
                    alert.evidence_count,
                    alert.status.as_str(),
                    alert.created_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }
    }

    Ok(())
}

fn build_engine(config: EngineConfig, pool: PgPool) -> Arc<StruggleEngine> {
    let store = Arc::new(PgAlertStore::new(pool.clone()));
    let interventions = Arc::new(PgInterventionQueue::new(pool));
    let hub = Arc::new(BroadcastHub::new());
    Arc::new(StruggleEngine::new(config, store, interventions, hub))
}

async fn replay_csv(
    engine: &StruggleEngine,
    csv_path: &std::path::Path,
    pace_ms: u64,
) -> anyhow::Result<(usize, usize)> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: Uuid,
        course_id: String,
        #[serde(rename = "type")]
        kind: InteractionKind,
        concept_id: Option<String>,
        correct: Option<bool>,
        time_spent_ms: Option<i64>,
        confidence: Option<f64>,
        sentiment: Option<Sentiment>,
        occurred_at: DateTime<Utc>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let event = InteractionEvent {
            student_id: row.student_id,
            course_id: row.course_id,
            kind: row.kind,
            concept_id: row.concept_id,
            correct: row.correct,
            time_spent_ms: row.time_spent_ms,
            confidence: row.confidence,
            sentiment: row.sentiment,
            occurred_at: row.occurred_at,
        };
        match engine.record(event).await {
            Ok(()) => accepted += 1,
            Err(err) => {
                warn!(error = %err, "replayed event rejected");
                rejected += 1;
            }
        }
        if pace_ms > 0 {
            tokio::time::sleep(Duration::from_millis(pace_ms)).await;
        }
    }

    Ok((accepted, rejected))
}
