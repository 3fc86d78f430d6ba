// Filter pointer reconciliation.
//
// The filter document lives off-chain; the chain only holds a pointer
// (url + sha256) to it. Reading means finding the newest pointer the owner
// really signed, fetching the document and checking its hash. Writing means
// editing the document, re-uploading it and anchoring a new pointer.
//
// Two pointer sources are supported:
//   memo    - two SPL memos (payload, detached signature) on a transaction
//             signed by the owner; newest valid one wins
//   program - a FilterSource account at the owner's PDA

use std::sync::Arc;
use std::time::Duration;

use solstage_client::rpc::{RpcClient, RpcError};
use solstage_client::storage::{FilterStore, StorageError};
use solstage_client::tx::{
    build_signed, initialize_instruction, memo_instruction, set_filter_instruction, Instruction,
    TxError,
};
use solstage_core::account::{AccountError, FilterSourceAccount};
use solstage_core::config::{Config, PointerSource};
use solstage_core::db::{CachedFilter, Database};
use solstage_core::filter::{self, Bucket, FilterDocument};
use solstage_core::hash::{hex_to_hash, sha256_hex, HashError};
use solstage_core::keys::{filter_source_pda, KeyError, Keypair, Pubkey};
use solstage_core::memo::{PointerPayload, SignedPayload};
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FilterError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("anchored hash is not valid: {0}")]
    Hash(#[from] HashError),

    #[error("failed to fetch filter document from {url}: {source}")]
    Fetch { url: String, source: reqwest::Error },

    #[error("filter document at {url} returned HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("filter document at {url} is empty")]
    EmptyDocument { url: String },

    #[error("filter document at {url} is not UTF-8")]
    NotUtf8 { url: String },

    #[error("filter document at {url} has hash {actual}, pointer expects {expected}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("filter document at {url} is not valid JSON: {source}")]
    Parse {
        url: String,
        source: serde_json::Error,
    },

    #[error("local cache error: {0}")]
    Cache(String),
}

impl From<anyhow::Error> for FilterError {
    fn from(e: anyhow::Error) -> Self {
        FilterError::Cache(format!("{e:#}"))
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Where a pointer was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerOrigin {
    Memo { signature: String, slot: u64 },
    Program { account: Pubkey },
}

/// A verified on-chain reference to a filter document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPointer {
    pub url: String,
    /// Lowercase hex sha256 of the document bytes.
    pub hash: String,
    pub origin: PointerOrigin,
}

impl FilterPointer {
    pub fn matches(&self, url: &str, hash: &str) -> bool {
        self.url == url && self.hash.eq_ignore_ascii_case(hash)
    }
}

/// The owner's current filter, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub pointer: Option<FilterPointer>,
    pub document: Option<FilterDocument>,
}

impl FilterState {
    /// The document, or an empty one when nothing has been anchored yet.
    pub fn document_or_empty(&self) -> FilterDocument {
        self.document.clone().unwrap_or_else(FilterDocument::empty)
    }
}

/// Result of a write: the new document and where it now lives.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub document: FilterDocument,
    pub url: String,
    pub hash: String,
    /// Anchoring transaction; `None` when the document hash was unchanged
    /// and nothing was published.
    pub signature: Option<String>,
}

/// Pointer lookup settings.
#[derive(Debug, Clone)]
pub struct PointerSettings {
    pub source: PointerSource,
    pub program_id: Pubkey,
    pub scan_limit: usize,
    /// 0 disables the age check.
    pub max_slot_age: u64,
}

impl PointerSettings {
    pub fn from_config(config: &Config) -> Result<Self, FilterError> {
        Ok(Self {
            source: config.pointer.source,
            program_id: config.pointer.program_id.parse()?,
            scan_limit: config.pointer.scan_limit,
            max_slot_age: config.pointer.max_slot_age,
        })
    }
}

/// A memo payload's `blockSlot` must not be after the slot of the
/// transaction carrying it, and must not be older than `max_age` slots.
pub fn slot_acceptable(block_slot: u64, tx_slot: u64, max_age: u64) -> bool {
    if block_slot > tx_slot {
        return false;
    }
    max_age == 0 || tx_slot - block_slot <= max_age
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    rpc: Arc<RpcClient>,
    store: Arc<dyn FilterStore>,
    db: Arc<Database>,
    http: reqwest::Client,
    settings: PointerSettings,
    file_name: String,
    confirm_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        rpc: Arc<RpcClient>,
        store: Arc<dyn FilterStore>,
        db: Arc<Database>,
        settings: PointerSettings,
        file_name: impl Into<String>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            store,
            db,
            http: reqwest::Client::new(),
            settings,
            file_name: file_name.into(),
            confirm_timeout,
        }
    }

    pub fn settings(&self) -> &PointerSettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Find the owner's current pointer, or `None` if there is none.
    pub async fn locate_pointer(&self, owner: &Pubkey) -> Result<Option<FilterPointer>, FilterError> {
        match self.settings.source {
            PointerSource::Memo => self.locate_memo_pointer(owner).await,
            PointerSource::Program => self.locate_program_pointer(owner).await,
        }
    }

    async fn locate_memo_pointer(&self, owner: &Pubkey) -> Result<Option<FilterPointer>, FilterError> {
        let signatures = self
            .rpc
            .get_signatures_for_address(owner, self.settings.scan_limit, None)
            .await?;
        debug!("scanning {} signatures for {owner}", signatures.len());

        for info in signatures {
            if info.err.is_some() {
                continue;
            }
            let Some(memo) = info.memo.as_deref() else {
                continue;
            };
            let signed = match SignedPayload::from_memo_field(memo) {
                Ok(signed) => signed,
                Err(e) => {
                    debug!("{}: not a pointer memo ({e})", info.signature);
                    continue;
                }
            };
            if !signed.verify(owner) {
                warn!("{}: payload signature does not verify for {owner}", info.signature);
                continue;
            }

            let Some(tx) = self.rpc.get_parsed_transaction(&info.signature).await? else {
                debug!("{}: transaction not found", info.signature);
                continue;
            };
            if tx.failed() {
                continue;
            }
            if !tx.is_signer(owner) {
                warn!("{}: {owner} did not sign the carrying transaction", info.signature);
                continue;
            }
            if !slot_acceptable(signed.payload.block_slot, tx.slot, self.settings.max_slot_age) {
                warn!(
                    "{}: blockSlot {} not acceptable for tx slot {}",
                    info.signature, signed.payload.block_slot, tx.slot
                );
                continue;
            }

            info!("pointer for {owner} found in {} at slot {}", info.signature, tx.slot);
            return Ok(Some(FilterPointer {
                url: signed.payload.url,
                hash: signed.payload.hash.to_ascii_lowercase(),
                origin: PointerOrigin::Memo {
                    signature: info.signature,
                    slot: tx.slot,
                },
            }));
        }

        Ok(None)
    }

    async fn locate_program_pointer(&self, owner: &Pubkey) -> Result<Option<FilterPointer>, FilterError> {
        let (pda, _) = filter_source_pda(owner, &self.settings.program_id)?;
        let Some(account) = self.rpc.get_account_info(&pda).await? else {
            debug!("no FilterSource account at {pda}");
            return Ok(None);
        };
        let decoded = FilterSourceAccount::decode(&account.data, true)?;
        if decoded.is_unset() {
            return Ok(None);
        }
        Ok(Some(FilterPointer {
            hash: decoded.hash_hex(),
            url: decoded.url,
            origin: PointerOrigin::Program { account: pda },
        }))
    }

    /// Fetch a document body. With `expected_hash`, the body must hash to it.
    pub async fn fetch_document(&self, url: &str, expected_hash: Option<&str>) -> Result<String, FilterError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|source| FilterError::Fetch {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FilterError::FetchStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(|source| FilterError::Fetch {
            url: url.to_string(),
            source,
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(FilterError::EmptyDocument { url: url.to_string() });
        }

        let actual = sha256_hex(&bytes);
        if let Some(expected) = expected_hash {
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FilterError::HashMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        String::from_utf8(bytes.to_vec()).map_err(|_| FilterError::NotUtf8 { url: url.to_string() })
    }

    fn parse_document(url: &str, content: &str) -> Result<FilterDocument, FilterError> {
        FilterDocument::from_json(content).map_err(|source| FilterError::Parse {
            url: url.to_string(),
            source,
        })
    }

    /// Locate the pointer and load the verified document it references.
    pub async fn load_filter(&self, owner: &Pubkey) -> Result<FilterState, FilterError> {
        let Some(pointer) = self.locate_pointer(owner).await? else {
            return Ok(FilterState {
                pointer: None,
                document: None,
            });
        };

        let owner_key = owner.to_string();
        if let Some(cached) = self.db.load_filter(&owner_key)? {
            if pointer.matches(&cached.url, &cached.hash) {
                debug!("using cached filter for {owner}");
                let document = Self::parse_document(&cached.url, &cached.content)?;
                return Ok(FilterState {
                    pointer: Some(pointer),
                    document: Some(document),
                });
            }
        }

        let content = self.fetch_document(&pointer.url, Some(&pointer.hash)).await?;
        let document = Self::parse_document(&pointer.url, &content)?;
        self.db.save_filter(&CachedFilter {
            owner: owner_key,
            url: pointer.url.clone(),
            hash: pointer.hash.clone(),
            content,
            verified_at: chrono::Utc::now(),
        })?;
        info!("loaded filter for {owner} from {}", pointer.url);

        Ok(FilterState {
            pointer: Some(pointer),
            document: Some(document),
        })
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    async fn send_and_confirm(&self, keypair: &Keypair, instructions: &[Instruction]) -> Result<String, FilterError> {
        let blockhash = self.rpc.get_latest_blockhash().await?;
        let tx = build_signed(keypair, instructions, &blockhash)?;
        let signature = self.rpc.send_transaction(&tx.to_base64()?).await?;
        self.rpc.confirm_transaction(&signature, self.confirm_timeout).await?;
        Ok(signature)
    }

    /// Instruction creating the owner's FilterSource account, if it does not
    /// exist yet.
    async fn initialize_if_missing(&self, owner: &Pubkey, pda: &Pubkey) -> Result<Option<Instruction>, FilterError> {
        if self.rpc.get_account_info(pda).await?.is_some() {
            return Ok(None);
        }
        info!("FilterSource account {pda} missing, initializing");
        Ok(Some(initialize_instruction(owner, pda, &self.settings.program_id)))
    }

    /// Anchor `(url, hash)` as the owner's pointer. Returns the transaction
    /// signature.
    pub async fn anchor(&self, keypair: &Keypair, url: &str, hash: &str) -> Result<String, FilterError> {
        let owner = keypair.pubkey();
        let instructions = match self.settings.source {
            PointerSource::Memo => {
                let slot = self.rpc.get_slot().await?;
                let signed = SignedPayload::sign(PointerPayload::new(url, hash, slot), keypair);
                let [payload, signature] = signed.memos();
                vec![
                    memo_instruction(&owner, &payload),
                    memo_instruction(&owner, &signature),
                ]
            }
            PointerSource::Program => {
                let hash_bytes = hex_to_hash(hash)?;
                let (pda, _) = filter_source_pda(&owner, &self.settings.program_id)?;
                let mut ixs: Vec<Instruction> =
                    self.initialize_if_missing(&owner, &pda).await?.into_iter().collect();
                ixs.push(set_filter_instruction(
                    &owner,
                    &pda,
                    &self.settings.program_id,
                    &hash_bytes,
                    url,
                ));
                ixs
            }
        };

        let signature = self.send_and_confirm(keypair, &instructions).await?;
        info!("anchored {url} ({hash}) in {signature}");
        Ok(signature)
    }

    /// Prepare the owner's pointer storage. Only the program source needs
    /// an account; returns the initializing transaction if one was sent.
    pub async fn init(&self, keypair: &Keypair) -> Result<Option<String>, FilterError> {
        if self.settings.source == PointerSource::Memo {
            return Ok(None);
        }
        let owner = keypair.pubkey();
        let (pda, _) = filter_source_pda(&owner, &self.settings.program_id)?;
        match self.initialize_if_missing(&owner, &pda).await? {
            Some(ix) => Ok(Some(self.send_and_confirm(keypair, &[ix]).await?)),
            None => Ok(None),
        }
    }

    /// Move `address` between buckets, publish the new document and
    /// re-anchor the pointer.
    pub async fn move_item(
        &self,
        keypair: &Keypair,
        address: &str,
        from: Bucket,
        to: Bucket,
    ) -> Result<MoveOutcome, FilterError> {
        let owner = keypair.pubkey();
        let state = self.load_filter(&owner).await?;
        let document = filter::move_item(&state.document_or_empty(), address, from, to);
        let content = document.to_json();
        let hash = sha256_hex(content.as_bytes());

        if let Some(pointer) = state.pointer.as_ref().filter(|p| p.hash.eq_ignore_ascii_case(&hash)) {
            info!("filter unchanged, pointer already current");
            return Ok(MoveOutcome {
                document,
                url: pointer.url.clone(),
                hash,
                signature: None,
            });
        }

        let url = self.store.put(&self.file_name, content.clone().into_bytes()).await?;
        let signature = Some(self.anchor(keypair, &url, &hash).await?);

        self.db.save_filter(&CachedFilter {
            owner: owner.to_string(),
            url: url.clone(),
            hash: hash.clone(),
            content,
            verified_at: chrono::Utc::now(),
        })?;

        Ok(MoveOutcome {
            document,
            url,
            hash,
            signature,
        })
    }

    /// Anchor an already-hosted document. Returns `(hash, signature)`.
    pub async fn set_filter_url(&self, keypair: &Keypair, url: &str) -> Result<(String, String), FilterError> {
        let content = self.fetch_document(url, None).await?;
        Self::parse_document(url, &content)?;
        let hash = sha256_hex(content.as_bytes());
        let signature = self.anchor(keypair, url, &hash).await?;

        self.db.save_filter(&CachedFilter {
            owner: keypair.pubkey().to_string(),
            url: url.to_string(),
            hash: hash.clone(),
            content,
            verified_at: chrono::Utc::now(),
        })?;
        Ok((hash, signature))
    }
}
