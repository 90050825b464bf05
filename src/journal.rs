//! Trade journal: durable log of execution results and position snapshots.
//!
//! The trading path never waits on the database. Entries go through an
//! unbounded channel to a [`JournalWriter`] task, which owns the storage.

use crate::types::{ExecutionResult, Position};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What happened to a position when its snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionEvent {
    Opened,
    Closed,
}

impl PositionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionEvent::Opened => "opened",
            PositionEvent::Closed => "closed",
        }
    }
}

/// Contract for persistence backends.
#[async_trait]
pub trait TradeJournal: Send + Sync {
    /// Store an execution result. Returns its row id.
    async fn record_execution(&self, result: &ExecutionResult) -> Result<i64>;

    /// Store a position snapshot. Returns its row id.
    async fn record_position(&self, position: &Position, event: PositionEvent) -> Result<i64>;

    async fn execution_count(&self) -> Result<i64>;

    /// Execution results for one token, oldest first.
    async fn executions_for(&self, token_address: &str) -> Result<Vec<ExecutionResult>>;

    async fn health_check(&self) -> Result<bool>;
}

#[derive(FromRow)]
struct ExecutionRow {
    result_json: String,
}

/// SQLite-backed journal.
pub struct SqliteJournal {
    pool: Pool<Sqlite>,
}

impl SqliteJournal {
    /// Connect to a SQLite URL such as `sqlite::memory:` or `sqlite:trades.db?mode=rwc`.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // Every new connection would be a new, empty database.
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to SQLite database {}", url))?;

        Self::create_schema(&pool).await?;
        info!("Trade journal connected to {}", url);
        Ok(Self { pool })
    }

    /// Open (creating if needed) a journal file.
    pub async fn open_file(path: &str) -> Result<Self> {
        Self::connect(&format!("sqlite:{}?mode=rwc", path)).await
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_address TEXT NOT NULL,
                side TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                signature TEXT,
                input_amount INTEGER,
                output_amount INTEGER,
                execution_price REAL,
                error_kind TEXT,
                attempts INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                result_json TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create executions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS position_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_address TEXT NOT NULL,
                event TEXT NOT NULL,
                entry_price REAL NOT NULL,
                quantity INTEGER NOT NULL,
                cost_basis_lamports INTEGER NOT NULL,
                last_price REAL NOT NULL,
                unrealized_pnl_sol REAL NOT NULL,
                recorded_at INTEGER NOT NULL,
                position_json TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create position_snapshots table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_token ON executions (token_address)")
            .execute(pool)
            .await
            .context("Failed to create executions index")?;

        Ok(())
    }
}

#[async_trait]
impl TradeJournal for SqliteJournal {
    async fn record_execution(&self, result: &ExecutionResult) -> Result<i64> {
        debug!("Journaling {} {} (success: {})", result.side, result.token_address, result.success);

        let error_kind = result
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok())
            .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string));

        let id = sqlx::query(
            r#"
            INSERT INTO executions (
                token_address, side, success, signature, input_amount, output_amount,
                execution_price, error_kind, attempts, timestamp, result_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.token_address)
        .bind(result.side.as_str())
        .bind(result.success)
        .bind(&result.signature)
        .bind(result.input_amount.map(|a| a as i64))
        .bind(result.output_amount.map(|a| a as i64))
        .bind(result.execution_price)
        .bind(error_kind)
        .bind(result.attempts as i64)
        .bind(result.timestamp as i64)
        .bind(serde_json::to_string(result)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert execution")?
        .last_insert_rowid();

        Ok(id)
    }

    async fn record_position(&self, position: &Position, event: PositionEvent) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO position_snapshots (
                token_address, event, entry_price, quantity, cost_basis_lamports,
                last_price, unrealized_pnl_sol, recorded_at, position_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.token_address)
        .bind(event.as_str())
        .bind(position.entry_price)
        .bind(position.quantity as i64)
        .bind(position.cost_basis_lamports as i64)
        .bind(position.last_price)
        .bind(position.unrealized_pnl_sol)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(serde_json::to_string(position)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert position snapshot")?
        .last_insert_rowid();

        Ok(id)
    }

    async fn execution_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM executions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count executions")?;
        Ok(count)
    }

    async fn executions_for(&self, token_address: &str) -> Result<Vec<ExecutionResult>> {
        let rows: Vec<ExecutionRow> =
            sqlx::query_as("SELECT result_json FROM executions WHERE token_address = ? ORDER BY id ASC")
                .bind(token_address)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch executions")?;

        rows.into_iter()
            .map(|row| serde_json::from_str(&row.result_json).context("Corrupt execution record"))
            .collect()
    }

    async fn health_check(&self) -> Result<bool> {
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

/// An entry waiting to be written.
#[derive(Debug, Clone)]
pub enum JournalEntry {
    Execution(ExecutionResult),
    Position { position: Position, event: PositionEvent },
}

/// Cheap, cloneable sending side. A disabled handle drops everything.
#[derive(Debug, Clone, Default)]
pub struct JournalHandle {
    sender: Option<mpsc::UnboundedSender<JournalEntry>>,
}

impl JournalHandle {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn record_execution(&self, result: &ExecutionResult) {
        self.send(JournalEntry::Execution(result.clone()));
    }

    pub fn record_position(&self, position: &Position, event: PositionEvent) {
        self.send(JournalEntry::Position {
            position: position.clone(),
            event,
        });
    }

    fn send(&self, entry: JournalEntry) {
        if let Some(sender) = &self.sender {
            if sender.send(entry).is_err() {
                debug!("Journal writer gone, entry dropped");
            }
        }
    }
}

/// Background task draining journal entries into storage.
pub struct JournalWriter {
    journal: Arc<dyn TradeJournal>,
    receiver: mpsc::UnboundedReceiver<JournalEntry>,
}

impl JournalWriter {
    pub fn new(journal: Arc<dyn TradeJournal>) -> (JournalHandle, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (JournalHandle { sender: Some(sender) }, Self { journal, receiver })
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        info!("Journal writer running");
        while let Some(entry) = self.receiver.recv().await {
            let written = match &entry {
                JournalEntry::Execution(result) => self.journal.record_execution(result).await,
                JournalEntry::Position { position, event } => self.journal.record_position(position, *event).await,
            };
            if let Err(e) = written {
                error!("Failed to journal {:?}: {:?}", entry, e);
            }
        }
        info!("Journal channel closed. Shutting down.");
    }
}

/// Wait up to `within` for a spawned writer to drain, then stop it.
///
/// Returns `false` when the writer had to be aborted because some handle
/// was still alive.
pub async fn finish_writer(mut task: JoinHandle<()>, within: Duration) -> Result<bool> {
    match timeout(within, &mut task).await {
        Ok(joined) => {
            joined.context("Journal writer panicked")?;
            Ok(true)
        }
        Err(_) => {
            warn!("Journal writer still has live handles after {:?}, stopping it", within);
            task.abort();
            Ok(false)
        }
    }
}
