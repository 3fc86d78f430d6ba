// Plain wallet operations: SOL transfers, token holdings and recent
// transaction history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use solstage_core::keys::{Keypair, Pubkey};
use thiserror::Error;
use tracing::info;

use crate::rpc::{RpcClient, RpcError, TokenAccount};
use crate::tx::{build_signed, transfer_instruction, TxError};

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error("invalid amount `{0}`: expected a positive SOL amount with at most 9 decimals")]
    BadAmount(String),

    #[error("balance {balance} lamports cannot cover {wanted} lamports")]
    InsufficientFunds { balance: u64, wanted: u64 },
}

/// Parse a decimal SOL amount into lamports without going through floats.
pub fn parse_sol(text: &str) -> Result<u64, WalletError> {
    let bad = || WalletError::BadAmount(text.to_string());
    let text = text.trim();
    let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 9 {
        return Err(bad());
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| bad())? };
    let frac: u64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}").parse().map_err(|_| bad())?
    };
    let lamports = whole
        .checked_mul(LAMPORTS_PER_SOL)
        .and_then(|l| l.checked_add(frac))
        .ok_or_else(bad)?;
    if lamports == 0 {
        return Err(bad());
    }
    Ok(lamports)
}

/// Render lamports as SOL, trimming trailing zeros.
pub fn format_sol(lamports: u64) -> String {
    let whole = lamports / LAMPORTS_PER_SOL;
    let frac = lamports % LAMPORTS_PER_SOL;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:09}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

/// Send `lamports` from the keypair's wallet to `to` and wait for
/// confirmation. Returns the transaction signature.
pub async fn transfer_sol(
    rpc: &RpcClient,
    keypair: &Keypair,
    to: &Pubkey,
    lamports: u64,
    confirm_timeout: Duration,
) -> Result<String, WalletError> {
    let from = keypair.pubkey();
    let balance = rpc.get_balance(&from).await?;
    if balance < lamports {
        return Err(WalletError::InsufficientFunds {
            balance,
            wanted: lamports,
        });
    }

    let blockhash = rpc.get_latest_blockhash().await?;
    let tx = build_signed(keypair, &[transfer_instruction(&from, to, lamports)], &blockhash)?;
    let signature = rpc.send_transaction(&tx.to_base64()?).await?;
    rpc.confirm_transaction(&signature, confirm_timeout).await?;
    info!("sent {} SOL from {from} to {to} in {signature}", format_sol(lamports));
    Ok(signature)
}

/// Token accounts under both the Token and Token-2022 programs.
pub async fn token_accounts(rpc: &RpcClient, owner: &Pubkey) -> Result<Vec<TokenAccount>, WalletError> {
    let mut accounts = rpc
        .get_token_accounts_by_owner(owner, &Pubkey::token_program())
        .await?;
    accounts.extend(
        rpc.get_token_accounts_by_owner(owner, &Pubkey::token_2022_program())
            .await?,
    );
    Ok(accounts)
}

/// One row of an address's transaction history.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionSummary {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub failed: bool,
}

/// The `limit` most recent transactions involving `address`, newest first.
pub async fn recent_transactions(
    rpc: &RpcClient,
    address: &Pubkey,
    limit: usize,
) -> Result<Vec<TransactionSummary>, WalletError> {
    let signatures = rpc.get_signatures_for_address(address, limit, None).await?;
    Ok(signatures
        .into_iter()
        .map(|info| TransactionSummary {
            block_time: info
                .block_time
                .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
            failed: info.err.is_some(),
            signature: info.signature,
            slot: info.slot,
        })
        .collect())
}
