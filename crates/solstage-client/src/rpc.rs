// Solana JSON-RPC client.
//
// Only the handful of methods the pointer protocol and the CLI need. Each
// call is a single POST with a `{"jsonrpc":"2.0","id":1,...}` body; errors in
// the JSON-RPC envelope surface as `RpcError::Rpc`.

use std::time::Duration;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use solstage_core::keys::Pubkey;
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("failed to decode rpc response: {0}")]
    Decode(String),

    #[error("transaction {signature} failed: {err}")]
    TransactionFailed { signature: String, err: String },

    #[error("transaction {0} not confirmed before timeout")]
    Timeout(String),
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// One entry of `getSignaturesForAddress`, newest first.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAccountKey {
    pub pubkey: String,
    #[serde(default)]
    pub signer: bool,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    pub account_keys: Vec<ParsedAccountKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsedTransactionBody {
    pub message: ParsedMessage,
    #[serde(default)]
    pub signatures: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionMeta {
    #[serde(default)]
    pub err: Option<Value>,
}

/// `getTransaction` with `jsonParsed` encoding, trimmed to what we read.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransaction {
    pub slot: u64,
    pub transaction: ParsedTransactionBody,
    #[serde(default)]
    pub meta: Option<TransactionMeta>,
    #[serde(default)]
    pub block_time: Option<i64>,
}

impl ParsedTransaction {
    pub fn is_signer(&self, key: &Pubkey) -> bool {
        let key = key.to_string();
        self.transaction
            .message
            .account_keys
            .iter()
            .any(|k| k.signer && k.pubkey == key)
    }

    pub fn failed(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.err.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub lamports: u64,
    pub owner: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub confirmation_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContextWrapped<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct RawAccountInfo {
    lamports: u64,
    owner: String,
    data: (String, String),
}

impl RawAccountInfo {
    fn decode(self, method: &str) -> Result<AccountInfo, RpcError> {
        if self.data.1 != "base64" {
            return Err(RpcError::Decode(format!(
                "{method}: unexpected data encoding {}",
                self.data.1
            )));
        }
        let data = base64::engine::general_purpose::STANDARD
            .decode(&self.data.0)
            .map_err(|e| RpcError::Decode(format!("{method}: {e}")))?;
        Ok(AccountInfo {
            lamports: self.lamports,
            owner: self.owner,
            data,
        })
    }
}

#[derive(Debug, Deserialize)]
struct KeyedRawAccount {
    pubkey: String,
    account: RawAccountInfo,
}

/// Server-side filter for `getProgramAccounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountFilter {
    DataSize(u64),
    /// Account data at `offset` starts with `bytes`.
    Memcmp { offset: usize, bytes: Vec<u8> },
}

impl AccountFilter {
    fn to_json(&self) -> Value {
        match self {
            AccountFilter::DataSize(size) => json!({ "dataSize": size }),
            AccountFilter::Memcmp { offset, bytes } => json!({
                "memcmp": { "offset": offset, "bytes": bs58::encode(bytes).into_string() }
            }),
        }
    }
}

/// A parsed SPL token account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccount {
    pub address: String,
    pub mint: String,
    /// Raw amount in base units.
    pub amount: u64,
    pub decimals: u8,
    /// Human-readable amount as reported by the node.
    pub ui_amount: String,
}

#[derive(Debug, Deserialize)]
struct KeyedParsedTokenAccount {
    pubkey: String,
    account: ParsedTokenAccountData,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenAccountData {
    data: ParsedTokenData,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenData {
    parsed: ParsedTokenPayload,
}

#[derive(Debug, Deserialize)]
struct ParsedTokenPayload {
    info: ParsedTokenInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedTokenInfo {
    mint: String,
    token_amount: ParsedTokenAmount,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedTokenAmount {
    amount: String,
    decimals: u8,
    #[serde(default)]
    ui_amount_string: Option<String>,
}

impl KeyedParsedTokenAccount {
    fn into_token_account(self) -> Result<TokenAccount, RpcError> {
        let info = self.account.data.parsed.info;
        let amount = info.token_amount.amount.parse().map_err(|_| {
            RpcError::Decode(format!(
                "getTokenAccountsByOwner: bad amount `{}` for {}",
                info.token_amount.amount, self.pubkey
            ))
        })?;
        Ok(TokenAccount {
            address: self.pubkey,
            mint: info.mint,
            amount,
            decimals: info.token_amount.decimals,
            ui_amount: info
                .token_amount
                .ui_amount_string
                .unwrap_or_else(|| info.token_amount.amount.clone()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Blockhash {
    blockhash: String,
}

fn commitment_rank(level: &str) -> u8 {
    match level {
        "processed" => 0,
        "confirmed" => 1,
        "finalized" => 2,
        _ => 1,
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    commitment: String,
    poll_interval: Duration,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, commitment: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            commitment: commitment.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Interval between `getSignatureStatuses` polls in `confirm_transaction`.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn commitment(&self) -> &str {
        &self.commitment
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        debug!("rpc {method}");

        let response = self.http.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RpcError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut envelope: Value = response.json().await?;
        if let Some(err) = envelope.get("error") {
            return Err(RpcError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        let result = envelope
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| RpcError::Decode(format!("{method}: response has no result")))?;
        serde_json::from_value(result).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    fn commitment_config(&self) -> Value {
        json!({ "commitment": self.commitment })
    }

    pub async fn get_slot(&self) -> Result<u64, RpcError> {
        self.call("getSlot", json!([self.commitment_config()])).await
    }

    pub async fn get_latest_blockhash(&self) -> Result<String, RpcError> {
        let wrapped: ContextWrapped<Blockhash> = self
            .call("getLatestBlockhash", json!([self.commitment_config()]))
            .await?;
        Ok(wrapped.value.blockhash)
    }

    /// Signatures involving `address`, newest first.
    pub async fn get_signatures_for_address(
        &self,
        address: &Pubkey,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        let mut config = json!({ "limit": limit, "commitment": self.commitment });
        if let Some(before) = before {
            config["before"] = json!(before);
        }
        self.call(
            "getSignaturesForAddress",
            json!([address.to_string(), config]),
        )
        .await
    }

    /// `None` when the node does not know the transaction.
    pub async fn get_parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ParsedTransaction>, RpcError> {
        self.call(
            "getTransaction",
            json!([
                signature,
                {
                    "encoding": "jsonParsed",
                    "commitment": self.commitment,
                    "maxSupportedTransactionVersion": 0,
                }
            ]),
        )
        .await
    }

    /// `None` when the account does not exist.
    pub async fn get_account_info(&self, address: &Pubkey) -> Result<Option<AccountInfo>, RpcError> {
        let wrapped: ContextWrapped<Option<RawAccountInfo>> = self
            .call(
                "getAccountInfo",
                json!([
                    address.to_string(),
                    { "encoding": "base64", "commitment": self.commitment }
                ]),
            )
            .await?;
        wrapped
            .value
            .map(|raw| raw.decode("getAccountInfo"))
            .transpose()
    }

    /// Several accounts in one call, in request order. At most 100 addresses.
    pub async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<AccountInfo>>, RpcError> {
        let keys: Vec<String> = addresses.iter().map(Pubkey::to_string).collect();
        let wrapped: ContextWrapped<Vec<Option<RawAccountInfo>>> = self
            .call(
                "getMultipleAccounts",
                json!([keys, { "encoding": "base64", "commitment": self.commitment }]),
            )
            .await?;
        wrapped
            .value
            .into_iter()
            .map(|raw| raw.map(|r| r.decode("getMultipleAccounts")).transpose())
            .collect()
    }

    /// Accounts owned by `program` that pass every filter.
    pub async fn get_program_accounts(
        &self,
        program: &Pubkey,
        filters: &[AccountFilter],
    ) -> Result<Vec<(Pubkey, AccountInfo)>, RpcError> {
        let filters: Vec<Value> = filters.iter().map(AccountFilter::to_json).collect();
        let raw: Vec<KeyedRawAccount> = self
            .call(
                "getProgramAccounts",
                json!([
                    program.to_string(),
                    { "encoding": "base64", "commitment": self.commitment, "filters": filters }
                ]),
            )
            .await?;
        raw.into_iter()
            .map(|keyed| {
                let key = keyed
                    .pubkey
                    .parse()
                    .map_err(|e| RpcError::Decode(format!("getProgramAccounts: {e}")))?;
                Ok((key, keyed.account.decode("getProgramAccounts")?))
            })
            .collect()
    }

    /// Token accounts of `owner` under one token program, `jsonParsed`.
    pub async fn get_token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        token_program: &Pubkey,
    ) -> Result<Vec<TokenAccount>, RpcError> {
        let wrapped: ContextWrapped<Vec<KeyedParsedTokenAccount>> = self
            .call(
                "getTokenAccountsByOwner",
                json!([
                    owner.to_string(),
                    { "programId": token_program.to_string() },
                    { "encoding": "jsonParsed", "commitment": self.commitment }
                ]),
            )
            .await?;
        wrapped
            .value
            .into_iter()
            .map(KeyedParsedTokenAccount::into_token_account)
            .collect()
    }

    /// Balance in lamports.
    pub async fn get_balance(&self, address: &Pubkey) -> Result<u64, RpcError> {
        let wrapped: ContextWrapped<u64> = self
            .call(
                "getBalance",
                json!([address.to_string(), self.commitment_config()]),
            )
            .await?;
        Ok(wrapped.value)
    }

    pub async fn request_airdrop(&self, address: &Pubkey, lamports: u64) -> Result<String, RpcError> {
        self.call(
            "requestAirdrop",
            json!([address.to_string(), lamports, self.commitment_config()]),
        )
        .await
    }

    /// Submit a signed, base64-encoded transaction. Returns its signature.
    pub async fn send_transaction(&self, tx_base64: &str) -> Result<String, RpcError> {
        self.call(
            "sendTransaction",
            json!([
                tx_base64,
                { "encoding": "base64", "preflightCommitment": self.commitment }
            ]),
        )
        .await
    }

    pub async fn get_signature_statuses(
        &self,
        signatures: &[String],
    ) -> Result<Vec<Option<SignatureStatus>>, RpcError> {
        let wrapped: ContextWrapped<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([signatures, { "searchTransactionHistory": false }]),
            )
            .await?;
        Ok(wrapped.value)
    }

    /// Poll until `signature` reaches the client's commitment level.
    pub async fn confirm_transaction(&self, signature: &str, timeout: Duration) -> Result<(), RpcError> {
        let wanted = commitment_rank(&self.commitment);
        let deadline = tokio::time::Instant::now() + timeout;
        let signatures = [signature.to_string()];

        loop {
            let statuses = self.get_signature_statuses(&signatures).await?;
            if let Some(Some(status)) = statuses.into_iter().next() {
                if let Some(err) = status.err {
                    return Err(RpcError::TransactionFailed {
                        signature: signature.to_string(),
                        err: err.to_string(),
                    });
                }
                let reached = status
                    .confirmation_status
                    .as_deref()
                    .map(commitment_rank)
                    .unwrap_or(0);
                if reached >= wanted {
                    debug!("{signature} reached {}", self.commitment);
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(RpcError::Timeout(signature.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
