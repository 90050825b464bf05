//! Paper-trading swap client.
//!
//! Fills orders against an in-memory price book instead of the network.
//! Faults can be injected per call so the pipeline's failure paths can be
//! exercised end to end.

use super::client::SwapClient;
use crate::types::{
    QuoteRequest, QuoteResult, SignatureStatus, SimulationReport, SwapTransaction, Pubkey, NATIVE_DECIMALS,
    NATIVE_MINT,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use solana_sdk::signature::Signature;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Fee taken from every fill
    pub fee_bps: u16,
    /// Uniform random price noise applied to every quote, +/- this many bps
    pub jitter_bps: u16,
    /// Confirmation polls before a submitted transaction shows as landed
    pub confirm_after_polls: u32,
    /// Decimals reported for mints without an explicit value
    pub default_decimals: u8,
    /// Shortfall of the settled output against the quote
    pub fill_shortfall_bps: u16,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            fee_bps: 30,
            jitter_bps: 0,
            confirm_after_polls: 1,
            default_decimals: 6,
            fill_shortfall_bps: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    simulation: u32,
    submission: u32,
    rejection: u32,
    lost: u32,
}

#[derive(Debug)]
enum Outcome {
    Land,
    Reject(String),
    /// Never observed by confirmation
    Lost,
}

#[derive(Debug)]
struct InFlight {
    polls_remaining: u32,
    outcome: Outcome,
    quoted_output: u64,
}

#[derive(Debug, Default)]
struct Book {
    /// SOL per whole token
    prices: HashMap<Pubkey, f64>,
    decimals: HashMap<Pubkey, u8>,
    submitted: HashMap<String, InFlight>,
    faults: Faults,
    quotes_served: u64,
    decimals_lookups: u64,
}

pub struct PaperClient {
    config: PaperConfig,
    book: Mutex<Book>,
}

impl PaperClient {
    pub fn new(config: PaperConfig) -> Self {
        info!("Paper client: fee {} bps, jitter {} bps", config.fee_bps, config.jitter_bps);
        Self {
            config,
            book: Mutex::new(Book::default()),
        }
    }

    /// Set the price of a token in SOL per whole token.
    pub async fn set_price(&self, mint: &str, sol_per_token: f64) {
        self.book.lock().await.prices.insert(mint.to_string(), sol_per_token);
    }

    pub async fn remove_price(&self, mint: &str) {
        self.book.lock().await.prices.remove(mint);
    }

    pub async fn set_decimals(&self, mint: &str, decimals: u8) {
        self.book.lock().await.decimals.insert(mint.to_string(), decimals);
    }

    pub async fn fail_next_simulations(&self, count: u32) {
        self.book.lock().await.faults.simulation += count;
    }

    pub async fn fail_next_submissions(&self, count: u32) {
        self.book.lock().await.faults.submission += count;
    }

    /// The next submissions land but fail on-chain.
    pub async fn reject_next_submissions(&self, count: u32) {
        self.book.lock().await.faults.rejection += count;
    }

    /// The next submissions are accepted but never confirm.
    pub async fn lose_next_submissions(&self, count: u32) {
        self.book.lock().await.faults.lost += count;
    }

    /// Make a lost transaction visible, as if it had landed late.
    pub async fn land_late(&self, signature: &str) {
        if let Some(tx) = self.book.lock().await.submitted.get_mut(signature) {
            tx.outcome = Outcome::Land;
            tx.polls_remaining = 0;
        }
    }

    /// Make a lost transaction fail on-chain once it is next looked up.
    pub async fn reject_late(&self, signature: &str) {
        if let Some(tx) = self.book.lock().await.submitted.get_mut(signature) {
            tx.outcome = Outcome::Reject("paper: expired before landing".to_string());
            tx.polls_remaining = 0;
        }
    }

    pub async fn quotes_served(&self) -> u64 {
        self.book.lock().await.quotes_served
    }

    pub async fn decimals_lookups(&self) -> u64 {
        self.book.lock().await.decimals_lookups
    }

    fn decimals_of(&self, book: &Book, mint: &str) -> u8 {
        if mint == NATIVE_MINT {
            return NATIVE_DECIMALS;
        }
        book.decimals.get(mint).copied().unwrap_or(self.config.default_decimals)
    }
}

impl Default for PaperClient {
    fn default() -> Self {
        Self::new(PaperConfig::default())
    }
}

fn random_signature() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill(&mut bytes[..]);
    Signature::from(bytes).to_string()
}

#[async_trait]
impl SwapClient for PaperClient {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<QuoteResult>> {
        let mut book = self.book.lock().await;
        book.quotes_served += 1;

        let (token, buying) = if request.input_mint == NATIVE_MINT {
            (request.output_mint.as_str(), true)
        } else {
            (request.input_mint.as_str(), false)
        };
        let Some(&price) = book.prices.get(token) else {
            debug!("No paper price for {}", token);
            return Ok(None);
        };

        let mut rng = rand::thread_rng();
        let jitter = if self.config.jitter_bps > 0 {
            let bps = self.config.jitter_bps as f64;
            rng.gen_range(-bps..=bps) / 10_000.0
        } else {
            0.0
        };
        let fill_price = price * (1.0 + jitter);
        let fee = 1.0 - self.config.fee_bps as f64 / 10_000.0;

        let token_scale = 10f64.powi(self.decimals_of(&book, token) as i32);
        let sol_scale = 10f64.powi(NATIVE_DECIMALS as i32);
        let amount = request.amount as f64;

        let out_amount = if buying {
            amount / sol_scale / fill_price * token_scale * fee
        } else {
            amount / token_scale * fill_price * sol_scale * fee
        };

        Ok(Some(QuoteResult {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            in_amount: request.amount,
            out_amount: out_amount.max(0.0) as u64,
            price_impact_pct: 0.0,
            route: json!({ "paper": true, "price": fill_price }),
            fetched_at: Instant::now(),
        }))
    }

    async fn build_transaction(&self, quote: &QuoteResult) -> Result<SwapTransaction> {
        let payload = serde_json::to_vec(&json!({
            "inputMint": quote.input_mint,
            "outputMint": quote.output_mint,
            "inAmount": quote.in_amount,
            "outAmount": quote.out_amount,
        }))?;
        Ok(SwapTransaction {
            signature: random_signature(),
            payload,
            last_valid_block_height: None,
        })
    }

    async fn simulate(&self, _transaction: &SwapTransaction) -> Result<SimulationReport> {
        let mut book = self.book.lock().await;
        if book.faults.simulation > 0 {
            book.faults.simulation -= 1;
            return Ok(SimulationReport::failed("paper: injected simulation failure"));
        }
        Ok(SimulationReport::ok())
    }

    async fn submit(&self, transaction: &SwapTransaction) -> Result<String> {
        let mut book = self.book.lock().await;
        if book.submitted.contains_key(&transaction.signature) {
            return Err(anyhow!("paper: duplicate submission of {}", transaction.signature));
        }
        let faults = &mut book.faults;

        if faults.submission > 0 {
            faults.submission -= 1;
            bail!("paper: injected submission failure");
        }
        let outcome = if faults.rejection > 0 {
            faults.rejection -= 1;
            Outcome::Reject("paper: slippage tolerance exceeded".to_string())
        } else if faults.lost > 0 {
            faults.lost -= 1;
            Outcome::Lost
        } else {
            Outcome::Land
        };

        let quoted_output = serde_json::from_slice::<Value>(&transaction.payload)
            .ok()
            .and_then(|payload| payload["outAmount"].as_u64())
            .unwrap_or(0);
        book.submitted.insert(
            transaction.signature.clone(),
            InFlight {
                polls_remaining: self.config.confirm_after_polls,
                outcome,
                quoted_output,
            },
        );
        Ok(transaction.signature.clone())
    }

    async fn confirm(&self, signature: &str) -> Result<SignatureStatus> {
        let mut book = self.book.lock().await;
        let Some(tx) = book.submitted.get_mut(signature) else {
            return Ok(SignatureStatus::Pending);
        };
        if tx.polls_remaining > 1 {
            tx.polls_remaining -= 1;
            return Ok(SignatureStatus::Pending);
        }
        tx.polls_remaining = 0;
        Ok(match &tx.outcome {
            Outcome::Land => SignatureStatus::Landed,
            Outcome::Reject(reason) => SignatureStatus::Failed(reason.clone()),
            Outcome::Lost => SignatureStatus::Pending,
        })
    }

    async fn settled_output(&self, signature: &str, _output_mint: &str) -> Result<Option<u64>> {
        let book = self.book.lock().await;
        let shortfall = self.config.fill_shortfall_bps.min(10_000) as u64;
        Ok(book
            .submitted
            .get(signature)
            .map(|tx| tx.quoted_output * (10_000 - shortfall) / 10_000))
    }

    async fn get_decimals(&self, mint: &str) -> Result<u8> {
        let mut book = self.book.lock().await;
        book.decimals_lookups += 1;
        Ok(self.decimals_of(&book, mint))
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}
