//! Live swap client: Jupiter aggregator for routes and transactions,
//! Solana RPC for simulation, submission and confirmation.

use super::client::SwapClient;
use crate::config::JupiterConfig;
use crate::types::{
    QuoteRequest, QuoteResult, SignatureStatus, SimulationReport, SwapTransaction, NATIVE_DECIMALS, NATIVE_MINT,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonempty::NonEmpty;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcSimulateTransactionConfig, RpcTransactionConfig};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signature, Signer};
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::{UiTransactionEncoding, UiTransactionTokenBalance};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Aggregator error codes that mean "no route", not "request failed".
const NO_ROUTE_CODES: [&str; 2] = ["COULD_NOT_FIND_ANY_ROUTE", "TOKEN_NOT_TRADABLE"];

/// SPL mint layout: decimals byte offset and minimum account length.
const MINT_DECIMALS_OFFSET: usize = 44;
const MINT_ACCOUNT_LEN: usize = 82;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    in_amount: String,
    out_amount: String,
    #[serde(default)]
    price_impact_pct: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
    #[serde(default)]
    last_valid_block_height: Option<u64>,
}

pub struct JupiterClient {
    http_client: Client,
    base_url: String,
    rpc_clients: NonEmpty<Arc<RpcClient>>,
    keypair: Arc<Keypair>,
    rate_limiter: DefaultDirectRateLimiter,
    priority_fee_lamports: Option<u64>,
    commitment: CommitmentConfig,
}

impl JupiterClient {
    /// Build a client, reading the signing keypair from `config.keypair_path`.
    pub fn new(config: &JupiterConfig) -> Result<Self> {
        let path = config
            .keypair_path
            .as_deref()
            .ok_or_else(|| anyhow!("jupiter.keypair_path is required for live trading"))?;
        let keypair = read_keypair_file(path).map_err(|e| anyhow!("Failed to read keypair {}: {}", path, e))?;
        Self::with_keypair(config, keypair)
    }

    pub fn with_keypair(config: &JupiterConfig, keypair: Keypair) -> Result<Self> {
        let commitment = parse_commitment(&config.commitment)?;

        let endpoints = NonEmpty::from_vec(config.rpc_endpoints.clone())
            .ok_or_else(|| anyhow!("jupiter.rpc_endpoints cannot be empty"))?;
        let rpc_clients = endpoints.map(|endpoint| {
            Arc::new(RpcClient::new_with_timeout_and_commitment(
                endpoint,
                Duration::from_secs(config.rpc_timeout_seconds),
                commitment,
            ))
        });

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        info!(
            "Jupiter client for wallet {} with {} RPC endpoints",
            keypair.pubkey(),
            rpc_clients.len()
        );

        Ok(Self {
            http_client,
            base_url: config.quote_api_url.trim_end_matches('/').to_string(),
            rpc_clients,
            keypair: Arc::new(keypair),
            rate_limiter,
            priority_fee_lamports: config.priority_fee_lamports,
            commitment,
        })
    }

    fn primary_rpc(&self) -> &RpcClient {
        &self.rpc_clients.head
    }

    fn decode_transaction(transaction: &SwapTransaction) -> Result<VersionedTransaction> {
        bincode::deserialize(&transaction.payload).context("Failed to decode swap transaction")
    }
}

#[async_trait]
impl SwapClient for JupiterClient {
    #[instrument(skip(self), fields(input = %request.input_mint, output = %request.output_mint))]
    async fn get_quote(&self, request: &QuoteRequest) -> Result<Option<QuoteResult>> {
        self.rate_limiter.until_ready().await;

        let amount = request.amount.to_string();
        let slippage_bps = request.slippage_bps.to_string();
        let response = self
            .http_client
            .get(format!("{}/quote", self.base_url))
            .query(&[
                ("inputMint", request.input_mint.as_str()),
                ("outputMint", request.output_mint.as_str()),
                ("amount", amount.as_str()),
                ("slippageBps", slippage_bps.as_str()),
            ])
            .send()
            .await
            .context("Quote request failed")?;

        let status = response.status();
        let body: Value = response.json().await.context("Failed to parse quote response")?;

        if status == StatusCode::BAD_REQUEST {
            let code = body.get("errorCode").and_then(Value::as_str).unwrap_or_default();
            if NO_ROUTE_CODES.contains(&code) {
                debug!("No route: {}", code);
                return Ok(None);
            }
        }
        if !status.is_success() {
            bail!("Quote API returned {}: {}", status, body);
        }

        let parsed: QuoteResponse = serde_json::from_value(body.clone()).context("Unexpected quote response shape")?;
        let in_amount = parsed.in_amount.parse().context("Invalid inAmount")?;
        let out_amount = parsed.out_amount.parse().context("Invalid outAmount")?;
        let price_impact_pct = parsed
            .price_impact_pct
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(Some(QuoteResult {
            input_mint: request.input_mint.clone(),
            output_mint: request.output_mint.clone(),
            in_amount,
            out_amount,
            price_impact_pct,
            route: body,
            fetched_at: Instant::now(),
        }))
    }

    #[instrument(skip(self, quote), fields(output = %quote.output_mint))]
    async fn build_transaction(&self, quote: &QuoteResult) -> Result<SwapTransaction> {
        self.rate_limiter.until_ready().await;

        let mut body = json!({
            "quoteResponse": quote.route,
            "userPublicKey": self.keypair.pubkey().to_string(),
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
        });
        if let Some(fee) = self.priority_fee_lamports {
            body["prioritizationFeeLamports"] = json!(fee);
        }

        let response = self
            .http_client
            .post(format!("{}/swap", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Swap request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Swap API returned {}: {}", status, text);
        }
        let swap: SwapResponse = response.json().await.context("Failed to parse swap response")?;

        let raw = STANDARD
            .decode(swap.swap_transaction)
            .context("Swap transaction is not valid base64")?;
        let unsigned: VersionedTransaction =
            bincode::deserialize(&raw).context("Failed to decode swap transaction")?;
        let signed = VersionedTransaction::try_new(unsigned.message, &[self.keypair.as_ref()])
            .map_err(|e| anyhow!("Failed to sign swap transaction: {}", e))?;

        let signature = signed
            .signatures
            .first()
            .ok_or_else(|| anyhow!("Signed transaction carries no signature"))?
            .to_string();
        let payload = bincode::serialize(&signed).context("Failed to encode signed transaction")?;

        debug!("Built swap transaction {}", signature);
        Ok(SwapTransaction {
            signature,
            payload,
            last_valid_block_height: swap.last_valid_block_height,
        })
    }

    #[instrument(skip(self, transaction), fields(signature = %transaction.signature))]
    async fn simulate(&self, transaction: &SwapTransaction) -> Result<SimulationReport> {
        let tx = Self::decode_transaction(transaction)?;
        let config = RpcSimulateTransactionConfig {
            sig_verify: true,
            commitment: Some(self.commitment),
            encoding: Some(UiTransactionEncoding::Base64),
            ..Default::default()
        };
        let response = self
            .primary_rpc()
            .simulate_transaction_with_config(&tx, config)
            .await
            .context("Simulation RPC failed")?;

        let result = response.value;
        Ok(match result.err {
            None => SimulationReport {
                success: true,
                error: None,
                units_consumed: result.units_consumed,
            },
            Some(err) => SimulationReport {
                success: false,
                error: Some(err.to_string()),
                units_consumed: result.units_consumed,
            },
        })
    }

    #[instrument(skip(self, transaction), fields(signature = %transaction.signature))]
    async fn submit(&self, transaction: &SwapTransaction) -> Result<String> {
        let tx = Self::decode_transaction(transaction)?;
        let config = RpcSendTransactionConfig {
            skip_preflight: true,
            max_retries: Some(0),
            encoding: Some(UiTransactionEncoding::Base64),
            ..Default::default()
        };

        // Every endpoint gets the transaction. The first acceptance wins;
        // the remaining sends keep running detached.
        let mut sends = JoinSet::new();
        for rpc in self.rpc_clients.iter().cloned() {
            let tx = tx.clone();
            sends.spawn(async move {
                let sent = rpc.send_transaction_with_config(&tx, config).await;
                (rpc.url(), sent)
            });
        }

        let mut last_error = None;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(signature))) => {
                    sends.detach_all();
                    return Ok(signature.to_string());
                }
                Ok((url, Err(e))) => {
                    debug!("Send to {} failed: {}", url, e);
                    last_error = Some(anyhow::Error::new(e));
                }
                Err(e) => warn!("Send task failed: {}", e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| anyhow!("no endpoint accepted the transaction"))
            .context("Transaction submission failed on every endpoint"))
    }

    #[instrument(skip(self))]
    async fn confirm(&self, signature: &str) -> Result<SignatureStatus> {
        let parsed = Signature::from_str(signature).context("Invalid signature")?;
        let response = self
            .primary_rpc()
            .get_signature_statuses(&[parsed])
            .await
            .context("Signature status RPC failed")?;

        let status = match response.value.into_iter().next().flatten() {
            None => SignatureStatus::Pending,
            Some(status) if !status.satisfies_commitment(self.commitment) => SignatureStatus::Pending,
            Some(status) => match status.err {
                None => SignatureStatus::Landed,
                Some(err) => SignatureStatus::Failed(err.to_string()),
            },
        };
        Ok(status)
    }

    /// Wallet balance change of `output_mint` in the landed transaction.
    #[instrument(skip(self))]
    async fn settled_output(&self, signature: &str, output_mint: &str) -> Result<Option<u64>> {
        let parsed = Signature::from_str(signature).context("Invalid signature")?;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Json),
            commitment: Some(self.commitment),
            max_supported_transaction_version: Some(0),
        };
        let landed = self
            .primary_rpc()
            .get_transaction_with_config(&parsed, config)
            .await
            .context("Failed to fetch landed transaction")?;
        let Some(meta) = landed.transaction.meta else {
            return Ok(None);
        };

        if output_mint == NATIVE_MINT {
            // The wallet pays the fee as account 0; add it back to isolate the proceeds.
            let (Some(pre), Some(post)) = (meta.pre_balances.first(), meta.post_balances.first()) else {
                return Ok(None);
            };
            return Ok(Some((post + meta.fee).saturating_sub(*pre)));
        }

        let wallet = self.keypair.pubkey().to_string();
        let pre = owned_token_amount(meta.pre_token_balances.into(), &wallet, output_mint);
        let post = owned_token_amount(meta.post_token_balances.into(), &wallet, output_mint);
        Ok(Some(post.saturating_sub(pre)))
    }

    #[instrument(skip(self))]
    async fn get_decimals(&self, mint: &str) -> Result<u8> {
        if mint == NATIVE_MINT {
            return Ok(NATIVE_DECIMALS);
        }
        let pubkey = Pubkey::from_str(mint).context("Invalid mint address")?;
        let account = self
            .primary_rpc()
            .get_account(&pubkey)
            .await
            .context("Failed to fetch mint account")?;

        if account.data.len() < MINT_ACCOUNT_LEN {
            warn!("Mint account {} is {} bytes", mint, account.data.len());
            bail!("Invalid mint account data length");
        }
        Ok(account.data[MINT_DECIMALS_OFFSET])
    }

    fn name(&self) -> &'static str {
        "jupiter"
    }
}

/// Raw units of `mint` held by `owner` across the listed token accounts.
fn owned_token_amount(balances: Option<Vec<UiTransactionTokenBalance>>, owner: &str, mint: &str) -> u64 {
    balances
        .unwrap_or_default()
        .iter()
        .filter(|balance| balance.mint == mint)
        .filter(|balance| Option::<&String>::from(balance.owner.as_ref()).map(String::as_str) == Some(owner))
        .filter_map(|balance| balance.ui_token_amount.amount.parse::<u64>().ok())
        .sum()
}

fn parse_commitment(level: &str) -> Result<CommitmentConfig> {
    match level {
        "processed" => Ok(CommitmentConfig::processed()),
        "confirmed" => Ok(CommitmentConfig::confirmed()),
        "finalized" => Ok(CommitmentConfig::finalized()),
        other => bail!("Unknown commitment level: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commitment() {
        assert_eq!(parse_commitment("confirmed").unwrap(), CommitmentConfig::confirmed());
        assert_eq!(parse_commitment("finalized").unwrap(), CommitmentConfig::finalized());
        assert!(parse_commitment("eventually").is_err());
    }

    #[test]
    fn test_requires_endpoints() {
        let config = JupiterConfig {
            rpc_endpoints: Vec::new(),
            ..JupiterConfig::default()
        };
        assert!(JupiterClient::with_keypair(&config, Keypair::new()).is_err());
    }

    #[test]
    fn test_requires_keypair_path() {
        assert!(JupiterClient::new(&JupiterConfig::default()).is_err());
    }

    #[test]
    fn test_quote_response_amounts_are_strings() {
        let raw = json!({
            "inAmount": "100000000",
            "outAmount": "4200000",
            "priceImpactPct": "0.0012",
            "routePlan": []
        });
        let parsed: QuoteResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.in_amount, "100000000");
        assert_eq!(parsed.out_amount, "4200000");
        assert_eq!(parsed.price_impact_pct.as_deref(), Some("0.0012"));
    }
}
