//! The seam between the execution pipeline and the outside world.
//!
//! One trait, two implementations: [`JupiterClient`](super::JupiterClient)
//! talks to the aggregator and the ledger, [`PaperClient`](super::PaperClient)
//! fills orders from an in-memory price book.

use crate::types::{QuoteRequest, QuoteResult, SignatureStatus, SimulationReport, SwapTransaction};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait SwapClient: Send + Sync {
    /// Request a route. `Ok(None)` means the aggregator has no route.
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<QuoteResult>>;

    /// Build and sign the swap transaction for a quote.
    async fn build_transaction(&self, quote: &QuoteResult) -> Result<SwapTransaction>;

    /// Dry-run a signed transaction against current ledger state.
    async fn simulate(&self, transaction: &SwapTransaction) -> Result<SimulationReport>;

    /// Send a signed transaction. Returns its signature.
    async fn submit(&self, transaction: &SwapTransaction) -> Result<String>;

    /// Look up a submitted signature at the configured commitment.
    async fn confirm(&self, signature: &str) -> Result<SignatureStatus>;

    /// Amount of `output_mint` a landed swap actually delivered to the wallet.
    ///
    /// `Ok(None)` when the client cannot tell; callers then settle on the quote.
    async fn settled_output(&self, _signature: &str, _output_mint: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Decimals of a mint. Immutable on the ledger, so callers may cache.
    async fn get_decimals(&self, mint: &str) -> Result<u8>;

    fn name(&self) -> &'static str;
}
