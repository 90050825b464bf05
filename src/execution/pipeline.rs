//! Execution pipeline: turns an approved [`Order`] into an [`ExecutionResult`].
//!
//! Each attempt runs quote, build, simulate, submit and confirm in order.
//! A retryable failure starts over with a fresh quote after a linear
//! backoff; a submit error is first checked against the ledger, since the
//! transaction may have landed through another endpoint. An unobserved
//! submission is reported as uncertain and never
//! retried, because its funds may already have moved. Nothing escapes
//! [`ExecutionPipeline::execute`]; every failure is folded into the result.

use super::client::SwapClient;
use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, Step};
use crate::metrics::{
    MetricsCollector, DECIMALS_CACHE_HITS, DECIMALS_CACHE_MISSES, EXECUTION_RETRIES, EXECUTION_SECONDS,
    ORDERS_ATTEMPTED, ORDERS_FAILED, ORDERS_FILLED, ORDERS_UNCERTAIN,
};
use crate::types::{lamports_to_sol, ExecutionResult, Order, QuoteResult, Side, SignatureStatus};
use anyhow::{anyhow, Context, Result};
use moka::future::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_retry::RetryIf;
use tracing::{debug, info, instrument, warn};

/// Amounts of a confirmed swap, in base units.
struct Fill {
    signature: String,
    input_amount: u64,
    output_amount: u64,
}

/// Quoted amounts of the last transaction handed to `submit`.
#[derive(Default)]
struct Submitted {
    input_amount: AtomicU64,
    output_amount: AtomicU64,
}

impl Submitted {
    fn record(&self, quote: &QuoteResult) {
        self.input_amount.store(quote.in_amount, Ordering::SeqCst);
        self.output_amount.store(quote.out_amount, Ordering::SeqCst);
    }

    fn amounts(&self) -> Option<(u64, u64)> {
        let output = self.output_amount.load(Ordering::SeqCst);
        (output > 0).then(|| (self.input_amount.load(Ordering::SeqCst), output))
    }
}

pub struct ExecutionPipeline {
    client: Arc<dyn SwapClient>,
    config: ExecutionConfig,
    /// Mint decimals never change, so entries never expire
    decimals: Cache<String, u8>,
    metrics: Arc<MetricsCollector>,
}

impl ExecutionPipeline {
    pub fn new(client: Arc<dyn SwapClient>, config: ExecutionConfig, metrics: Arc<MetricsCollector>) -> Self {
        let decimals = Cache::builder().max_capacity(config.decimals_cache_capacity).build();
        info!(
            "Execution pipeline on {} client: {} attempts, {}ms base backoff, {}x{}ms confirmation",
            client.name(),
            config.max_attempts,
            config.base_backoff_ms,
            config.confirm_max_polls,
            config.confirm_poll_interval_ms
        );
        Self {
            client,
            config,
            decimals,
            metrics,
        }
    }

    pub fn client(&self) -> &Arc<dyn SwapClient> {
        &self.client
    }

    /// Run an order to completion. Never fails; inspect the result.
    #[instrument(skip(self), fields(token = %order.token_address, side = %order.side))]
    pub async fn execute(&self, order: &Order) -> ExecutionResult {
        let started = Instant::now();
        self.metrics.increment_counter(ORDERS_ATTEMPTED).await;

        let attempts = AtomicU32::new(0);
        let submitted = Submitted::default();
        let base = self.config.base_backoff();
        let backoff = (1..self.config.max_attempts).map(move |n| base * n);

        let outcome = RetryIf::spawn(
            backoff,
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                self.attempt(order, attempt, &submitted)
            },
            |error: &ExecutionError| {
                let retry = error.is_retryable();
                if retry {
                    warn!("Attempt failed, re-quoting: {}", error);
                }
                retry
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        self.metrics.record_duration(EXECUTION_SECONDS, started.elapsed()).await;

        match outcome {
            Ok(fill) => {
                let price = self.execution_price(order, &fill).await;
                self.metrics.increment_counter(ORDERS_FILLED).await;
                info!(
                    "Filled {} {} in {} attempt(s): {} -> {} ({})",
                    order.side, order.token_address, attempts, fill.input_amount, fill.output_amount, fill.signature
                );
                ExecutionResult::filled(order, fill.signature, fill.input_amount, fill.output_amount, price, attempts)
            }
            Err(error) => {
                if matches!(error, ExecutionError::Uncertain { .. }) {
                    self.metrics.increment_counter(ORDERS_UNCERTAIN).await;
                    warn!("Outcome of {} {} is unknown: {}", order.side, order.token_address, error);
                    return ExecutionResult::uncertain(order, error, attempts, submitted.amounts());
                }
                self.metrics.increment_counter(ORDERS_FAILED).await;
                warn!("{} {} failed after {} attempt(s): {}", order.side, order.token_address, attempts, error);
                ExecutionResult::failed(order, error, attempts)
            }
        }
    }

    async fn attempt(&self, order: &Order, attempt: u32, submitted: &Submitted) -> Result<Fill, ExecutionError> {
        if attempt > 1 {
            self.metrics.increment_counter(EXECUTION_RETRIES).await;
        }
        debug!("Attempt {}/{}", attempt, self.config.max_attempts);

        let request = order.quote_request();
        let quote = self
            .call(Step::Quote, self.client.get_quote(&request))
            .await?
            .ok_or_else(|| ExecutionError::NoRoute {
                input_mint: request.input_mint.clone(),
                output_mint: request.output_mint.clone(),
            })?;
        if quote.out_amount == 0 {
            return Err(ExecutionError::ZeroOutput);
        }

        let transaction = self.call(Step::Build, self.client.build_transaction(&quote)).await?;

        self.ensure_fresh(&quote)?;
        let report = self.call(Step::Simulate, self.client.simulate(&transaction)).await?;
        if !report.success {
            return Err(ExecutionError::Simulation {
                message: report.error.unwrap_or_else(|| "unknown simulation error".to_string()),
            });
        }

        self.ensure_fresh(&quote)?;
        submitted.record(&quote);
        let signature = match timeout(self.config.call_timeout(), self.client.submit(&transaction)).await {
            Ok(Ok(signature)) => signature,
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                // A send can fail on one endpoint after another accepted it.
                if !self.landed_despite_error(&transaction.signature, &message).await? {
                    return Err(ExecutionError::Submission { message });
                }
                transaction.signature.clone()
            }
            Err(_) => {
                // The transaction may be in flight; its signature is already known.
                warn!("Submit of {} timed out, polling for it", transaction.signature);
                transaction.signature.clone()
            }
        };

        self.await_confirmation(&signature).await?;
        // Routes are exact-in: only the output can differ from the quote.
        let output_amount = self
            .settled_output(&signature, &quote.output_mint, quote.out_amount)
            .await;
        Ok(Fill {
            signature,
            input_amount: quote.in_amount,
            output_amount,
        })
    }

    /// One status check for a transaction whose submission reported an error.
    ///
    /// `Ok(true)` if it landed anyway. A transaction seen failing on-chain is
    /// a rejection; one not seen is treated as never sent.
    async fn landed_despite_error(&self, signature: &str, message: &str) -> Result<bool, ExecutionError> {
        sleep(self.config.confirm_poll_interval()).await;
        match self.check_signature(signature).await {
            Ok(SignatureStatus::Landed) => {
                warn!("Submit of {} reported \"{}\" but the transaction landed", signature, message);
                Ok(true)
            }
            Ok(SignatureStatus::Failed(reason)) => Err(ExecutionError::Rejected {
                signature: signature.to_string(),
                reason,
            }),
            Ok(SignatureStatus::Pending) => Ok(false),
            Err(e) => {
                debug!("Status check after failed submit of {}: {:#}", signature, e);
                Ok(false)
            }
        }
    }

    /// Output a landed swap delivered, or `quoted` when the client cannot tell.
    pub async fn settled_output(&self, signature: &str, output_mint: &str, quoted: u64) -> u64 {
        match timeout(self.config.call_timeout(), self.client.settled_output(signature, output_mint)).await {
            Ok(Ok(Some(settled))) => {
                if settled != quoted {
                    info!("{} delivered {} of {} quoted", signature, settled, quoted);
                }
                settled
            }
            Ok(Ok(None)) => quoted,
            Ok(Err(e)) => {
                warn!("Settled amount of {} unavailable, using quote: {:#}", signature, e);
                quoted
            }
            Err(_) => {
                warn!("Settled amount lookup for {} timed out, using quote", signature);
                quoted
            }
        }
    }

    async fn call<T, F>(&self, step: Step, future: F) -> Result<T, ExecutionError>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.config.call_timeout(), future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(step_error(step, e)),
            Err(_) => Err(ExecutionError::Timeout {
                step,
                after_ms: self.config.call_timeout_ms,
            }),
        }
    }

    fn ensure_fresh(&self, quote: &QuoteResult) -> Result<(), ExecutionError> {
        if quote.is_stale(self.config.quote_ttl()) {
            return Err(ExecutionError::StaleQuote {
                age_ms: quote.age().as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Poll a signature until it lands, fails, or the poll budget runs out.
    async fn await_confirmation(&self, signature: &str) -> Result<(), ExecutionError> {
        let max_polls = self.config.confirm_max_polls;
        for poll in 1..=max_polls {
            sleep(self.config.confirm_poll_interval()).await;
            match self.check_signature(signature).await {
                Ok(SignatureStatus::Landed) => {
                    debug!("{} landed on poll {}", signature, poll);
                    return Ok(());
                }
                Ok(SignatureStatus::Failed(reason)) => {
                    return Err(ExecutionError::Rejected {
                        signature: signature.to_string(),
                        reason,
                    });
                }
                Ok(SignatureStatus::Pending) => debug!("{} not observed yet ({}/{})", signature, poll, max_polls),
                Err(e) => warn!("Confirmation poll {}/{} for {} failed: {:#}", poll, max_polls, signature, e),
            }
        }
        Err(ExecutionError::Uncertain {
            signature: signature.to_string(),
            polls: max_polls,
        })
    }

    /// One status lookup, bounded by the per-call timeout.
    pub async fn check_signature(&self, signature: &str) -> Result<SignatureStatus> {
        timeout(self.config.call_timeout(), self.client.confirm(signature))
            .await
            .map_err(|_| anyhow!("Signature status lookup timed out"))?
    }

    /// Decimals of a mint, fetched at most once per process.
    pub async fn decimals(&self, mint: &str) -> Result<u8> {
        if let Some(decimals) = self.decimals.get(mint).await {
            self.metrics.increment_counter(DECIMALS_CACHE_HITS).await;
            return Ok(decimals);
        }

        let call_timeout = self.config.call_timeout();
        self.decimals
            .try_get_with(mint.to_string(), async {
                self.metrics.increment_counter(DECIMALS_CACHE_MISSES).await;
                timeout(call_timeout, self.client.get_decimals(mint))
                    .await
                    .map_err(|_| anyhow!("Decimals lookup timed out"))?
                    .with_context(|| format!("Failed to fetch decimals for {}", mint))
            })
            .await
            .map_err(|e| anyhow!("{:#}", e))
    }

    /// SOL per whole token for a swap of `lamports` against `token_units`.
    pub async fn price(&self, mint: &str, lamports: u64, token_units: u64) -> Option<f64> {
        let decimals = match self.decimals(mint).await {
            Ok(decimals) => decimals,
            Err(e) => {
                warn!("No price for {}: {:#}", mint, e);
                return None;
            }
        };
        let tokens = token_units as f64 / 10f64.powi(decimals as i32);
        (tokens > 0.0).then(|| lamports_to_sol(lamports) / tokens)
    }

    async fn execution_price(&self, order: &Order, fill: &Fill) -> Option<f64> {
        let (lamports, token_units) = match order.side {
            Side::Buy => (fill.input_amount, fill.output_amount),
            Side::Sell => (fill.output_amount, fill.input_amount),
        };
        self.price(&order.token_address, lamports, token_units).await
    }

    /// Lamports a sell of `quantity` would return right now, if routable.
    pub async fn quote_value(&self, token_address: &str, quantity: u64, slippage_bps: u16) -> Option<u64> {
        let request = Order::sell(token_address, quantity, slippage_bps).quote_request();
        match self.call(Step::Quote, self.client.get_quote(&request)).await {
            Ok(Some(quote)) => Some(quote.out_amount),
            Ok(None) => {
                debug!("No sell route for {}", token_address);
                None
            }
            Err(e) => {
                warn!("Mark quote for {} failed: {}", token_address, e);
                None
            }
        }
    }

    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let base = self.config.base_backoff();
        (1..self.config.max_attempts).map(|n| base * n).collect()
    }
}

fn step_error(step: Step, error: anyhow::Error) -> ExecutionError {
    let message = format!("{:#}", error);
    match step {
        Step::Quote => ExecutionError::Quote { message },
        Step::Build => ExecutionError::Build { message },
        Step::Simulate => ExecutionError::Simulation { message },
        Step::Submit | Step::Confirm => ExecutionError::Submission { message },
    }
}
