// NFT sources: Helius DAS, the Solflare portfolio API, and Metaplex
// metadata read straight from the cluster.
//
// All map their responses into `NftAsset`, the one shape the gallery works
// with. Helius pages through `getAssetsByOwner` with retries; Solflare returns
// everything in one response and is cached locally for a few minutes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use solstage_core::db::Database;
use solstage_core::keys::{metadata_address, Pubkey};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rpc::{RpcClient, RpcError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NftError {
    #[error("indexer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("indexer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("indexer error: {0}")]
    Indexer(String),

    #[error("failed to decode indexer response: {0}")]
    Decode(String),

    #[error("nft cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<anyhow::Error> for NftError {
    fn from(e: anyhow::Error) -> Self {
        NftError::Cache(format!("{e:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub trait_type: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorPrice {
    pub currency: String,
    pub price: f64,
}

/// An NFT as displayed in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftAsset {
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub symbol: Option<String>,
    /// Collection address. Assets without one are not shown.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub floor_price: Option<FloorPrice>,
}

/// Something that can list the NFTs held by a wallet.
#[async_trait]
pub trait NftSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn owned_assets(&self, owner: &Pubkey) -> Result<Vec<NftAsset>, NftError>;
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, NftError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NftError::Status {
        status: status.as_u16(),
        body,
    })
}

// ---------------------------------------------------------------------------
// Helius DAS
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DasPage {
    #[serde(default)]
    items: Vec<DasAsset>,
}

#[derive(Debug, Deserialize)]
struct DasAsset {
    id: String,
    #[serde(default)]
    content: Option<DasContent>,
    #[serde(default)]
    grouping: Vec<DasGrouping>,
    #[serde(default)]
    compression: Option<DasCompression>,
}

#[derive(Debug, Deserialize)]
struct DasContent {
    #[serde(default)]
    metadata: Option<DasMetadata>,
    #[serde(default)]
    links: Option<DasLinks>,
    #[serde(default)]
    files: Vec<DasFile>,
}

#[derive(Debug, Deserialize)]
struct DasMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    attributes: Vec<DasAttribute>,
}

#[derive(Debug, Deserialize)]
struct DasAttribute {
    #[serde(default)]
    trait_type: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct DasLinks {
    #[serde(default)]
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DasFile {
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DasGrouping {
    group_key: String,
    group_value: String,
}

#[derive(Debug, Deserialize)]
struct DasCompression {
    #[serde(default)]
    compressed: bool,
}

impl From<DasAsset> for NftAsset {
    fn from(asset: DasAsset) -> Self {
        let group = asset
            .grouping
            .into_iter()
            .find(|g| g.group_key == "collection")
            .map(|g| g.group_value);
        let content = asset.content;
        let (name, symbol, attributes) = match content.as_ref().and_then(|c| c.metadata.as_ref()) {
            Some(meta) => (
                meta.name.clone().unwrap_or_default(),
                meta.symbol.clone().filter(|s| !s.is_empty()),
                meta.attributes
                    .iter()
                    .map(|a| Attribute {
                        trait_type: a.trait_type.clone(),
                        value: a.value.clone(),
                    })
                    .collect(),
            ),
            None => (String::new(), None, Vec::new()),
        };
        let image_url = content.as_ref().and_then(|c| {
            c.links
                .as_ref()
                .and_then(|l| l.image.clone())
                .or_else(|| c.files.iter().find_map(|f| f.uri.clone()))
        });

        NftAsset {
            address: asset.id,
            name,
            compressed: asset.compression.is_some_and(|c| c.compressed),
            symbol,
            group,
            group_name: None,
            image_url,
            attributes,
            floor_price: None,
        }
    }
}

/// Paging and retry knobs for [`HeliusClient`].
#[derive(Debug, Clone)]
pub struct HeliusPaging {
    pub page_size: u32,
    pub max_pages: u32,
    pub max_attempts: u32,
    pub page_delay: Duration,
    /// Back-off unit; attempt `i` (0-based) waits `i * retry_delay` after failing.
    pub retry_delay: Duration,
}

impl Default for HeliusPaging {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10,
            max_attempts: 5,
            page_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub struct HeliusClient {
    http: reqwest::Client,
    url: String,
    paging: HeliusPaging,
}

impl HeliusClient {
    pub fn new(url: impl Into<String>, paging: HeliusPaging) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            paging,
        }
    }

    async fn fetch_page(&self, owner: &Pubkey, page: u32) -> Result<Vec<NftAsset>, NftError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": "getAssetsByOwner",
            "params": {
                "ownerAddress": owner.to_string(),
                "options": {
                    "showUnverifiedCollections": false,
                    "showCollectionMetadata": false,
                    "showFungible": false,
                    "showNativeBalance": false,
                    "showInscription": false,
                    "showZeroBalance": false,
                },
                "page": page,
                "limit": self.paging.page_size,
            }
        });

        let response = self.http.post(&self.url).json(&body).send().await?;
        let mut envelope: Value = error_for_status(response).await?.json().await?;
        if let Some(err) = envelope.get("error") {
            return Err(NftError::Indexer(err.to_string()));
        }
        let result = envelope
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| NftError::Decode("getAssetsByOwner: no result".into()))?;
        let page: DasPage =
            serde_json::from_value(result).map_err(|e| NftError::Decode(e.to_string()))?;
        Ok(page.items.into_iter().map(NftAsset::from).collect())
    }

    async fn fetch_page_with_retry(&self, owner: &Pubkey, page: u32) -> Result<Vec<NftAsset>, NftError> {
        let mut attempt = 0;
        loop {
            match self.fetch_page(owner, page).await {
                Ok(items) => return Ok(items),
                Err(e) if attempt + 1 < self.paging.max_attempts => {
                    warn!("getAssetsByOwner page {page} attempt {} failed: {e}", attempt + 1);
                    tokio::time::sleep(self.paging.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl NftSource for HeliusClient {
    fn name(&self) -> &'static str {
        "helius"
    }

    async fn owned_assets(&self, owner: &Pubkey) -> Result<Vec<NftAsset>, NftError> {
        let mut assets = Vec::new();
        for page in 1..=self.paging.max_pages {
            let items = self.fetch_page_with_retry(owner, page).await?;
            let short = items.len() < self.paging.page_size as usize;
            debug!("page {page}: {} assets", items.len());
            assets.extend(items);
            if short || page == self.paging.max_pages {
                break;
            }
            tokio::time::sleep(self.paging.page_delay).await;
        }
        info!("helius returned {} assets for {owner}", assets.len());
        Ok(assets)
    }
}

// ---------------------------------------------------------------------------
// Solflare portfolio
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PortfolioResponse {
    #[serde(default)]
    nfts: Vec<PortfolioNft>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortfolioNft {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    compressed: bool,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    group_single: Option<String>,
    #[serde(default)]
    group_name: Option<String>,
    #[serde(default)]
    currency_floor: Option<CurrencyFloor>,
}

#[derive(Debug, Deserialize)]
struct CurrencyFloor {
    #[serde(default)]
    price: Option<f64>,
}

const SCAM_GROUP: &str = "scam";

impl From<PortfolioNft> for NftAsset {
    fn from(nft: PortfolioNft) -> Self {
        NftAsset {
            address: nft.id,
            name: nft.name,
            compressed: nft.compressed,
            symbol: nft.symbol,
            group: nft.group.or(nft.group_single),
            group_name: nft.group_name,
            image_url: nft.image,
            attributes: nft.attributes,
            floor_price: nft
                .currency_floor
                .and_then(|f| f.price)
                .map(|price| FloorPrice {
                    currency: "USD".into(),
                    price,
                }),
        }
    }
}

pub struct SolflareClient {
    http: reqwest::Client,
    base_url: String,
    cache: Option<(Arc<Database>, chrono::Duration)>,
}

impl SolflareClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            cache: None,
        }
    }

    /// Cache responses in `db` for `ttl`.
    pub fn with_cache(mut self, db: Arc<Database>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        self.cache = Some((db, ttl));
        self
    }

    fn cached(&self, owner: &str) -> Option<Vec<NftAsset>> {
        let (db, _) = self.cache.as_ref()?;
        let data = match db.get_nft_cache(owner, self.name()) {
            Ok(data) => data?,
            Err(e) => {
                warn!("nft cache read failed: {e:#}");
                return None;
            }
        };
        match serde_json::from_str(&data) {
            Ok(assets) => Some(assets),
            Err(e) => {
                warn!("discarding unreadable nft cache entry for {owner}: {e}");
                None
            }
        }
    }

    fn store(&self, owner: &str, assets: &[NftAsset]) -> Result<(), NftError> {
        let Some((db, ttl)) = &self.cache else {
            return Ok(());
        };
        let data = serde_json::to_string(assets).map_err(|e| NftError::Decode(e.to_string()))?;
        db.put_nft_cache(owner, self.name(), &data, *ttl)?;
        Ok(())
    }
}

#[async_trait]
impl NftSource for SolflareClient {
    fn name(&self) -> &'static str {
        "solflare"
    }

    async fn owned_assets(&self, owner: &Pubkey) -> Result<Vec<NftAsset>, NftError> {
        let owner = owner.to_string();
        if let Some(assets) = self.cached(&owner) {
            debug!("solflare cache hit for {owner}");
            return Ok(assets);
        }

        let url = format!("{}/{owner}", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("network", "mainnet"), ("currency", "USD"), ("listings", "1")])
            .send()
            .await?;
        let portfolio: PortfolioResponse = error_for_status(response)
            .await?
            .json()
            .await
            .map_err(|e| NftError::Decode(e.to_string()))?;

        let assets: Vec<NftAsset> = portfolio
            .nfts
            .into_iter()
            .map(NftAsset::from)
            .filter(|a| a.group.as_deref() != Some(SCAM_GROUP))
            .collect();
        info!("solflare returned {} assets for {owner}", assets.len());

        self.store(&owner, &assets)?;
        Ok(assets)
    }
}

// ---------------------------------------------------------------------------
// Metaplex on-chain metadata
// ---------------------------------------------------------------------------

/// The fields of a Metaplex metadata account the gallery shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadata {
    pub mint: Pubkey,
    pub name: String,
    pub symbol: String,
    pub uri: String,
    pub collection: Option<Pubkey>,
}

/// Borsh reader over metadata account bytes.
struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.data.get(self.at..self.at.checked_add(n)?)?;
        self.at += n;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)?.try_into().ok().map(u32::from_le_bytes)
    }

    fn pubkey(&mut self) -> Option<Pubkey> {
        self.take(32)?.try_into().ok().map(Pubkey::new)
    }

    /// Skip the optional edition nonce and token standard, then read the
    /// collection key if one is set.
    fn collection(&mut self) -> Option<Pubkey> {
        if self.u8()? == 1 {
            self.u8()?;
        }
        if self.u8()? == 1 {
            self.u8()?;
        }
        if self.u8()? != 1 {
            return None;
        }
        let _verified = self.u8()?;
        self.pubkey()
    }

    /// Metadata strings are fixed-width and padded with NULs.
    fn string(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        Some(String::from_utf8_lossy(raw).trim_end_matches('\0').trim().to_string())
    }
}

impl TokenMetadata {
    /// Decode a metadata account. `None` when the data is too short or
    /// not a metadata record.
    pub fn decode(data: &[u8]) -> Option<Self> {
        const METADATA_V1: u8 = 4;
        let mut r = Reader { data, at: 0 };
        if r.u8()? != METADATA_V1 {
            return None;
        }
        let _update_authority = r.pubkey()?;
        let mint = r.pubkey()?;
        let name = r.string()?;
        let symbol = r.string()?;
        let uri = r.string()?;
        let _seller_fee = r.take(2)?;
        if r.u8()? == 1 {
            let creators = r.u32()? as usize;
            r.take(creators.checked_mul(34)?)?;
        }
        let _primary_sale = r.u8()?;
        let _is_mutable = r.u8()?;
        // Older accounts end before the collection field.
        let collection = r.collection();
        Some(TokenMetadata {
            mint,
            name,
            symbol,
            uri,
            collection,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct OffChainJson {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    attributes: Vec<DasAttribute>,
}

const MAX_MULTIPLE_ACCOUNTS: usize = 100;

/// Lists NFTs from the wallet's token accounts: every account holding
/// exactly one token of a zero-decimal mint whose metadata decodes.
pub struct MetaplexClient {
    http: reqwest::Client,
    rpc: Arc<RpcClient>,
}

impl MetaplexClient {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc,
        }
    }

    async fn nft_mints(&self, owner: &Pubkey) -> Result<Vec<Pubkey>, NftError> {
        let mut mints = Vec::new();
        for program in [Pubkey::token_program(), Pubkey::token_2022_program()] {
            for account in self.rpc.get_token_accounts_by_owner(owner, &program).await? {
                if account.amount != 1 || account.decimals != 0 {
                    continue;
                }
                match account.mint.parse() {
                    Ok(mint) => mints.push(mint),
                    Err(e) => warn!("skipping token account {}: {e}", account.address),
                }
            }
        }
        Ok(mints)
    }

    /// Image and attributes from the metadata uri. A failed fetch leaves
    /// the asset without them.
    async fn off_chain(&self, uri: &str) -> OffChainJson {
        if uri.is_empty() {
            return OffChainJson::default();
        }
        let fetched = async {
            let response = self.http.get(uri).send().await?;
            error_for_status(response)
                .await?
                .json::<OffChainJson>()
                .await
                .map_err(NftError::from)
        };
        match fetched.await {
            Ok(json) => json,
            Err(e) => {
                warn!("metadata json {uri} unavailable: {e}");
                OffChainJson::default()
            }
        }
    }
}

#[async_trait]
impl NftSource for MetaplexClient {
    fn name(&self) -> &'static str {
        "metaplex"
    }

    async fn owned_assets(&self, owner: &Pubkey) -> Result<Vec<NftAsset>, NftError> {
        let mints = self.nft_mints(owner).await?;
        debug!("{} candidate nft mints for {owner}", mints.len());

        let mut metadata = Vec::new();
        for chunk in mints.chunks(MAX_MULTIPLE_ACCOUNTS) {
            let addresses = chunk
                .iter()
                .map(metadata_address)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| NftError::Decode(e.to_string()))?;
            let accounts = self.rpc.get_multiple_accounts(&addresses).await?;
            metadata.extend(
                accounts
                    .into_iter()
                    .flatten()
                    .filter_map(|account| TokenMetadata::decode(&account.data)),
            );
        }

        let mut assets = Vec::with_capacity(metadata.len());
        for meta in metadata {
            let json = self.off_chain(&meta.uri).await;
            let group = meta.collection.map(|c| c.to_string());
            assets.push(NftAsset {
                address: meta.mint.to_string(),
                name: meta.name,
                compressed: false,
                symbol: Some(meta.symbol).filter(|s| !s.is_empty()),
                group_name: group.clone(),
                group,
                image_url: json.image,
                attributes: json
                    .attributes
                    .into_iter()
                    .map(|a| Attribute {
                        trait_type: a.trait_type,
                        value: a.value,
                    })
                    .collect(),
                floor_price: None,
            });
        }
        info!("metaplex returned {} assets for {owner}", assets.len());
        Ok(assets)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
