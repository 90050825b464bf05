//! Execution pipeline behaviour against a scripted swap client.

use anyhow::{bail, Result};
use async_trait::async_trait;
use h_5n1p3r_engine::config::ExecutionConfig;
use h_5n1p3r_engine::error::{ExecutionError, Step};
use h_5n1p3r_engine::execution::{ExecutionPipeline, SwapClient};
use h_5n1p3r_engine::metrics::{MetricsCollector, DECIMALS_CACHE_MISSES, EXECUTION_RETRIES};
use h_5n1p3r_engine::types::{
    Order, QuoteRequest, QuoteResult, SignatureStatus, SimulationReport, SwapTransaction,
};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const TOKEN: &str = "ScriptToken11111111111111111111111111111111";

#[derive(Debug, Clone, Copy)]
enum SubmitStep {
    Accept,
    Fail,
    /// Reaches the network, then reports an error
    FailAfterBroadcast,
    Hang,
}

/// A client whose steps follow per-test scripts. Unscripted steps succeed.
#[derive(Default)]
struct ScriptedClient {
    quote_calls: AtomicU32,
    submit_calls: AtomicU32,
    decimals_calls: AtomicU32,
    hang_quotes: bool,
    build_delay: Option<Duration>,
    fail_simulations: bool,
    fail_decimals: bool,
    submits: Mutex<VecDeque<SubmitStep>>,
    statuses: Mutex<VecDeque<SignatureStatus>>,
    never_confirm: bool,
    /// Quote id each built transaction was made from
    built_from: Mutex<Vec<u64>>,
    /// Signatures that reached the network
    accepted: Mutex<HashSet<String>>,
    settled: Option<u64>,
}

impl ScriptedClient {
    async fn script_submits(&self, steps: &[SubmitStep]) {
        self.submits.lock().await.extend(steps.iter().copied());
    }

    async fn script_statuses(&self, statuses: Vec<SignatureStatus>) {
        self.statuses.lock().await.extend(statuses);
    }
}

#[async_trait]
impl SwapClient for ScriptedClient {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<QuoteResult>> {
        let id = self.quote_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang_quotes {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(Some(QuoteResult {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            in_amount: request.amount,
            out_amount: 2_000_000,
            price_impact_pct: 0.1,
            route: json!({ "id": id }),
            fetched_at: Instant::now(),
        }))
    }

    async fn build_transaction(&self, quote: &QuoteResult) -> Result<SwapTransaction> {
        if let Some(delay) = self.build_delay {
            tokio::time::sleep(delay).await;
        }
        let id = quote.route["id"].as_u64().unwrap_or(0);
        let signature = format!("sig-{}", id);
        self.built_from.lock().await.push(id);
        Ok(SwapTransaction {
            signature,
            payload: Vec::new(),
            last_valid_block_height: None,
        })
    }

    async fn simulate(&self, _transaction: &SwapTransaction) -> Result<SimulationReport> {
        if self.fail_simulations {
            return Ok(SimulationReport::failed("insufficient funds"));
        }
        Ok(SimulationReport::ok())
    }

    async fn submit(&self, transaction: &SwapTransaction) -> Result<String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.submits.lock().await.pop_front().unwrap_or(SubmitStep::Accept);
        if !matches!(step, SubmitStep::Fail) {
            self.accepted.lock().await.insert(transaction.signature.clone());
        }
        match step {
            SubmitStep::Accept => Ok(transaction.signature.clone()),
            SubmitStep::Fail => bail!("connection reset by peer"),
            SubmitStep::FailAfterBroadcast => bail!("secondary endpoint: connection reset by peer"),
            SubmitStep::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(transaction.signature.clone())
            }
        }
    }

    async fn confirm(&self, signature: &str) -> Result<SignatureStatus> {
        if self.never_confirm || !self.accepted.lock().await.contains(signature) {
            return Ok(SignatureStatus::Pending);
        }
        Ok(self
            .statuses
            .lock()
            .await
            .pop_front()
            .unwrap_or(SignatureStatus::Landed))
    }

    async fn settled_output(&self, _signature: &str, _output_mint: &str) -> Result<Option<u64>> {
        Ok(self.settled)
    }

    async fn get_decimals(&self, _mint: &str) -> Result<u8> {
        self.decimals_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_decimals {
            bail!("account not found");
        }
        Ok(6)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        max_attempts: 3,
        base_backoff_ms: 1,
        call_timeout_ms: 50,
        confirm_max_polls: 3,
        confirm_poll_interval_ms: 1,
        quote_ttl_ms: 5_000,
        decimals_cache_capacity: 100,
    }
}

fn pipeline(client: Arc<ScriptedClient>, config: ExecutionConfig) -> (ExecutionPipeline, Arc<MetricsCollector>) {
    let metrics = Arc::new(MetricsCollector::new());
    (ExecutionPipeline::new(client, config, metrics.clone()), metrics)
}

fn buy() -> Order {
    Order::buy(TOKEN, 100_000_000, 500)
}

#[tokio::test]
async fn test_submit_failure_requotes() {
    let client = Arc::new(ScriptedClient::default());
    client.script_submits(&[SubmitStep::Fail]).await;
    let (pipeline, metrics) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(client.quote_calls.load(Ordering::SeqCst), 2);
    // The second transaction was built from the second quote, not the first.
    assert_eq!(*client.built_from.lock().await, vec![1, 2]);
    assert_eq!(result.signature.as_deref(), Some("sig-2"));
    assert_eq!(metrics.counter(EXECUTION_RETRIES).await, 1);
}

#[tokio::test]
async fn test_submit_error_after_broadcast_is_not_resent() {
    let client = Arc::new(ScriptedClient::default());
    client.script_submits(&[SubmitStep::FailAfterBroadcast]).await;
    let (pipeline, metrics) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.signature.as_deref(), Some("sig-1"));
    assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.quote_calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.counter(EXECUTION_RETRIES).await, 0);
}

#[tokio::test]
async fn test_submit_error_then_onchain_failure_is_a_rejection() {
    let client = Arc::new(ScriptedClient::default());
    client
        .script_submits(&[SubmitStep::FailAfterBroadcast, SubmitStep::Accept])
        .await;
    client
        .script_statuses(vec![SignatureStatus::Failed("slippage exceeded".to_string())])
        .await;
    let (pipeline, _) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    // The first transaction failed on-chain; the retry used a fresh quote.
    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.signature.as_deref(), Some("sig-2"));
}

#[tokio::test]
async fn test_fill_uses_settled_output() {
    let client = Arc::new(ScriptedClient {
        settled: Some(1_990_000),
        ..ScriptedClient::default()
    });
    let (pipeline, _) = pipeline(client, fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(result.success);
    assert_eq!(result.input_amount, Some(100_000_000));
    assert_eq!(result.output_amount, Some(1_990_000));
}

#[tokio::test]
async fn test_unconfirmed_submission_is_uncertain_and_terminal() {
    let client = Arc::new(ScriptedClient {
        never_confirm: true,
        ..ScriptedClient::default()
    });
    let (pipeline, _) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);
    match result.error {
        Some(ExecutionError::Uncertain { ref signature, polls }) => {
            assert_eq!(signature, "sig-1");
            assert_eq!(polls, 3);
        }
        ref other => panic!("expected uncertain, got {:?}", other),
    }
    assert_eq!(result.signature.as_deref(), Some("sig-1"));
}

#[tokio::test]
async fn test_onchain_failure_is_retried() {
    let client = Arc::new(ScriptedClient::default());
    client
        .script_statuses(vec![SignatureStatus::Failed("slippage exceeded".to_string())])
        .await;
    let (pipeline, _) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(client.submit_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejections_exhaust_attempts() {
    let client = Arc::new(ScriptedClient::default());
    let failed = SignatureStatus::Failed("slippage exceeded".to_string());
    client
        .script_statuses(vec![failed.clone(), failed.clone(), failed])
        .await;
    let (pipeline, _) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert!(matches!(result.error, Some(ExecutionError::Rejected { .. })));
    assert_eq!(result.signature.as_deref(), Some("sig-3"));
}

#[tokio::test]
async fn test_submit_timeout_polls_known_signature() {
    let client = Arc::new(ScriptedClient::default());
    client.script_submits(&[SubmitStep::Hang]).await;
    let (pipeline, _) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.signature.as_deref(), Some("sig-1"));
    assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_simulation_failure_never_submits() {
    let client = Arc::new(ScriptedClient {
        fail_simulations: true,
        ..ScriptedClient::default()
    });
    let (pipeline, _) = pipeline(client.clone(), fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(client.quote_calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.submit_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        result.error,
        Some(ExecutionError::Simulation {
            message: "insufficient funds".to_string()
        })
    );
}

#[tokio::test]
async fn test_stale_quote_is_not_submitted() {
    let client = Arc::new(ScriptedClient {
        build_delay: Some(Duration::from_millis(30)),
        ..ScriptedClient::default()
    });
    let config = ExecutionConfig {
        quote_ttl_ms: 5,
        ..fast_config()
    };
    let (pipeline, _) = pipeline(client.clone(), config);

    let result = pipeline.execute(&buy()).await;

    assert!(!result.success);
    assert!(matches!(result.error, Some(ExecutionError::StaleQuote { .. })));
    assert_eq!(client.submit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_quote_timeout() {
    let client = Arc::new(ScriptedClient {
        hang_quotes: true,
        ..ScriptedClient::default()
    });
    let config = ExecutionConfig {
        max_attempts: 1,
        ..fast_config()
    };
    let (pipeline, _) = pipeline(client, config);

    let result = pipeline.execute(&buy()).await;

    assert_eq!(
        result.error,
        Some(ExecutionError::Timeout {
            step: Step::Quote,
            after_ms: 50
        })
    );
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_decimals_fetched_once_per_mint() {
    let client = Arc::new(ScriptedClient::default());
    let (pipeline, metrics) = pipeline(client.clone(), fast_config());

    for _ in 0..3 {
        let result = pipeline.execute(&buy()).await;
        assert!(result.success);
        // 0.1 SOL for 2 tokens
        let price = result.execution_price.unwrap();
        assert!((price - 0.05).abs() < 1e-12);
    }

    assert_eq!(client.decimals_calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.counter(DECIMALS_CACHE_MISSES).await, 1);
}

#[tokio::test]
async fn test_decimals_failure_keeps_trade_successful() {
    let client = Arc::new(ScriptedClient {
        fail_decimals: true,
        ..ScriptedClient::default()
    });
    let (pipeline, _) = pipeline(client, fast_config());

    let result = pipeline.execute(&buy()).await;

    assert!(result.success);
    assert!(result.execution_price.is_none());
    assert_eq!(result.output_amount, Some(2_000_000));
}
