//! Main entry point for the H-5N1P3R execution engine demo
//!
//! Runs the engine against the paper client with a handful of synthetic
//! candidates. Set `SNIPER_CONFIG` to a JSON config file to override the
//! defaults, and `SNIPER_MODE=live` to trade through Jupiter instead.

use anyhow::Result;
use h_5n1p3r_engine::execution::{PaperClient, PaperConfig};
use h_5n1p3r_engine::journal::{finish_writer, JournalHandle, JournalWriter, SqliteJournal, TradeJournal};
use h_5n1p3r_engine::types::{Candidate, LAMPORTS_PER_SOL};
use h_5n1p3r_engine::{EngineConfig, JupiterClient, Notifier, SwapClient, TradingEngine};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const JOURNAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const DEMO_TOKENS: [(&str, f64, f64); 4] = [
    ("DemoMintA1111111111111111111111111111111111", 0.85, 0.000_020),
    ("DemoMintB2222222222222222222222222222222222", 0.72, 0.000_450),
    ("DemoMintC3333333333333333333333333333333333", 0.40, 0.001_000),
    ("DemoMintD4444444444444444444444444444444444", 0.91, 0.000_003),
];

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting H-5N1P3R execution engine");

    let config = match std::env::var("SNIPER_CONFIG") {
        Ok(path) => EngineConfig::load(&path)?,
        Err(_) => EngineConfig::default(),
    };
    let live = std::env::var("SNIPER_MODE").map(|m| m == "live").unwrap_or(false);

    // Journal off the critical path
    let journal_url = config
        .journal_url
        .clone()
        .unwrap_or_else(|| "sqlite:trades.db?mode=rwc".to_string());
    let journal: Arc<dyn TradeJournal> = Arc::new(SqliteJournal::connect(&journal_url).await?);
    let (journal_handle, journal_writer): (JournalHandle, JournalWriter) = JournalWriter::new(journal.clone());
    let journal_task = tokio::spawn(journal_writer.run());

    // Notifications are only logged here
    let (notifier, mut notifications) = Notifier::channel(256);
    let notify_task = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match serde_json::to_string(&notification) {
                Ok(json) => info!("Notification: {}", json),
                Err(e) => warn!("Unserializable notification {}: {}", notification.kind(), e),
            }
        }
    });

    let client: Arc<dyn SwapClient> = if live {
        info!("Live mode: trading through {}", config.jupiter.quote_api_url);
        Arc::new(JupiterClient::new(&config.jupiter)?)
    } else {
        let paper = PaperClient::new(PaperConfig {
            jitter_bps: 50,
            ..PaperConfig::default()
        });
        for (mint, _, price) in DEMO_TOKENS {
            paper.set_price(mint, price).await;
        }
        Arc::new(paper)
    };

    let engine = TradingEngine::new(config, client, notifier, journal_handle);
    let (candidate_tx, candidate_rx) = mpsc::channel(100);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(candidate_rx, shutdown_rx).await }
    });

    if !live {
        for (mint, confidence, _) in DEMO_TOKENS {
            let candidate = Candidate::new(mint, confidence).with_size_hint(LAMPORTS_PER_SOL / 20);
            candidate_tx.send(candidate).await?;
            sleep(Duration::from_millis(100)).await;
        }
    }

    // Let the monitor mark the demo positions for a while
    sleep(Duration::from_secs(5)).await;

    let state = engine.risk_metrics().await;
    info!(
        "Balance {:.4} SOL, drawdown {:.2}%, {} open position(s)",
        state.current_balance, state.drawdown_pct, state.open_position_count
    );
    for position in engine.positions().await {
        info!(
            "Holding {}: {} units, unrealized {:+.6} SOL",
            position.token_address, position.quantity, position.unrealized_pnl_sol
        );
    }
    info!("Journaled {} execution(s)", journal.execution_count().await?);

    shutdown_tx.send(true)?;
    drop(candidate_tx);
    engine_task.await?;

    drop(engine);
    // Detached sell tasks may still hold journal handles.
    finish_writer(journal_task, JOURNAL_DRAIN_TIMEOUT).await?;
    notify_task.abort();

    info!("Demo completed");
    Ok(())
}
