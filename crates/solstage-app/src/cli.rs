// Command-line interface for the `solstage` binary.
//
// Each subcommand builds the clients it needs from the loaded config, runs
// one flow and prints the result to stdout. Logging goes to the log file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use solstage_client::nft::{
    HeliusClient, HeliusPaging, MetaplexClient, NftAsset, NftSource, SolflareClient,
};
use solstage_client::rpc::RpcClient;
use solstage_client::storage::{
    FilterStore, NamedAccountStore, ShadowDriveStore, StorageAccounts, UnconfiguredStore,
};
use solstage_client::swap::JupiterClient;
use solstage_client::wallet::{self, format_sol, parse_sol};
use solstage_core::config::{self, parse_storage_size, Config, IndexerSource};
use solstage_core::db::{Database, HELIUS_ENDPOINT_KEY};
use solstage_core::filter::Bucket;
use solstage_core::keys::{Keypair, Pubkey};
use tracing::{debug, info, warn};

use crate::gallery;
use crate::reconcile::{PointerOrigin, PointerSettings, Reconciler};

const DEFAULT_TRANSACTION_LIMIT: usize = 20;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Sort your Solana NFTs into stage, backstage and junkbox, anchored on-chain.
#[derive(Debug, Parser)]
#[command(name = "solstage")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory holding config/, defaults/ and logs/
    #[arg(long, global = true, default_value = ".")]
    pub base_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show a wallet's NFTs by bucket
    Nfts { owner: String },

    /// Inspect or set the filter document
    Filter {
        #[command(subcommand)]
        command: FilterCommand,
    },

    /// Move an NFT between buckets and publish the new filter
    Move {
        nft: String,
        #[arg(long)]
        from: Bucket,
        #[arg(long)]
        to: Bucket,
    },

    /// Create the on-chain filter account (program pointer source)
    Init,

    /// Show a SOL balance (defaults to the configured wallet)
    Balance { address: Option<String> },

    /// Request a devnet/testnet airdrop to the configured wallet
    Airdrop { sol: String },

    /// Send SOL from the configured wallet
    Send { to: String, sol: String },

    /// List recent transactions (defaults to the configured wallet)
    Transactions {
        address: Option<String>,
        #[arg(long, default_value_t = DEFAULT_TRANSACTION_LIMIT)]
        limit: usize,
    },

    /// List token accounts (defaults to the configured wallet)
    Tokens { address: Option<String> },

    /// List the wallet's Shadow Drive storage accounts
    Storage,

    /// Swap SOL for SHDW to pay for storage
    Swap { shdw: f64 },

    /// Read and write local settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum FilterCommand {
    /// Print the verified filter document for a wallet
    Show { owner: String },

    /// Anchor a filter document that is already hosted at `url`
    SetUrl { url: String },
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Get { key: String },
    Set { key: String, value: String },
    Unset { key: String },
    List,
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Config plus the clients every command shares.
pub struct AppContext {
    pub config: Config,
    pub base_dir: PathBuf,
    pub db: Arc<Database>,
    pub rpc: Arc<RpcClient>,
}

/// Expand a leading `~/` against the home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let dirs = directories::UserDirs::new().context("cannot determine home directory")?;
            Ok(dirs.home_dir().join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

impl AppContext {
    pub fn load(base_dir: &Path) -> Result<Self> {
        let config = config::load_config(base_dir).context("failed to load configuration")?;
        let db_path = base_dir.join(&config.db_path);
        let db = Database::open(&db_path.to_string_lossy()).context("failed to open database")?;
        let rpc = RpcClient::new(config.cluster.rpc_url.clone(), config.cluster.commitment.clone());
        info!("config loaded from {}, rpc {}", base_dir.display(), config.cluster.rpc_url);

        Ok(Self {
            config,
            base_dir: base_dir.to_path_buf(),
            db: Arc::new(db),
            rpc: Arc::new(rpc),
        })
    }

    pub fn keypair_path(&self) -> Result<PathBuf> {
        let configured = self
            .config
            .wallet
            .keypair_path
            .as_deref()
            .unwrap_or("~/.config/solana/id.json");
        expand_home(configured)
    }

    pub fn keypair(&self) -> Result<Keypair> {
        let path = self.keypair_path()?;
        Ok(Keypair::read_json_file(&path)?)
    }

    fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.config.cluster.confirm_timeout_secs)
    }

    /// Helius endpoint: the local setting wins over the config file.
    pub fn helius_url(&self) -> Result<String> {
        if let Some(url) = self.db.get_setting(HELIUS_ENDPOINT_KEY)? {
            return Ok(url);
        }
        match self.config.helius_url() {
            Some(url) => Ok(url),
            None => bail!(
                "no Helius API key configured; set helius_api_key in config/credentials.toml \
                 or run `solstage settings set {HELIUS_ENDPOINT_KEY} <url>`"
            ),
        }
    }

    pub fn nft_source(&self) -> Result<Box<dyn NftSource>> {
        let indexer = &self.config.indexer;
        Ok(match indexer.source {
            IndexerSource::Helius => Box::new(HeliusClient::new(
                self.helius_url()?,
                HeliusPaging {
                    page_size: indexer.page_size,
                    max_pages: indexer.max_pages,
                    max_attempts: indexer.max_attempts,
                    page_delay: Duration::from_millis(indexer.page_delay_ms),
                    retry_delay: Duration::from_millis(indexer.retry_delay_ms),
                },
            )),
            IndexerSource::Solflare => Box::new(
                SolflareClient::new(indexer.solflare_url.clone())
                    .with_cache(self.db.clone(), Duration::from_secs(indexer.cache_ttl_secs)),
            ),
            IndexerSource::Metaplex => Box::new(MetaplexClient::new(self.rpc.clone())),
        })
    }

    pub fn storage_accounts(&self, keypair: Arc<Keypair>) -> Result<StorageAccounts> {
        let storage = &self.config.storage;
        Ok(StorageAccounts::new(
            self.rpc.clone(),
            storage.endpoint.clone(),
            parse_pubkey(&storage.program_id)?,
            parse_pubkey(&storage.uploader)?,
            keypair,
        ))
    }

    /// The pinned storage account if one is configured, otherwise the
    /// wallet's account named `storage.identifier`, created on first write.
    pub fn store(&self, keypair: Arc<Keypair>) -> Result<Arc<dyn FilterStore>> {
        let storage = &self.config.storage;
        if let Some(account) = storage.storage_account.as_deref() {
            let account: Pubkey = account
                .parse()
                .with_context(|| format!("storage.storage_account `{account}` is not a public key"))?;
            return Ok(Arc::new(ShadowDriveStore::new(
                storage.endpoint.clone(),
                storage.public_base_url.clone(),
                account,
                keypair,
            )));
        }
        let size = parse_storage_size(&storage.initial_size)
            .with_context(|| format!("storage.initial_size `{}` is not a size", storage.initial_size))?;
        Ok(Arc::new(NamedAccountStore::new(
            self.storage_accounts(keypair)?,
            storage.identifier.clone(),
            size,
            storage.public_base_url.clone(),
        )))
    }

    pub fn reconciler(&self, store: Arc<dyn FilterStore>) -> Result<Reconciler> {
        Ok(Reconciler::new(
            self.rpc.clone(),
            store,
            self.db.clone(),
            PointerSettings::from_config(&self.config)?,
            self.config.storage.file_name.clone(),
            self.confirm_timeout(),
        ))
    }

    /// Reconciler that can read pointers but not publish documents.
    pub fn read_only_reconciler(&self) -> Result<Reconciler> {
        self.reconciler(Arc::new(UnconfiguredStore))
    }

    /// Reconciler able to upload and anchor on behalf of `keypair`.
    pub fn writing_reconciler(&self, keypair: Arc<Keypair>) -> Result<Reconciler> {
        let store = self.store(keypair)?;
        self.reconciler(store)
    }
}

fn parse_pubkey(s: &str) -> Result<Pubkey> {
    s.parse()
        .with_context(|| format!("`{s}` is not a valid Solana address"))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn run(cli: Cli) -> Result<()> {
    let ctx = AppContext::load(&cli.base_dir)?;
    match cli.command {
        Commands::Nfts { owner } => nfts(&ctx, &owner).await,
        Commands::Filter {
            command: FilterCommand::Show { owner },
        } => filter_show(&ctx, &owner).await,
        Commands::Filter {
            command: FilterCommand::SetUrl { url },
        } => filter_set_url(&ctx, &url).await,
        Commands::Move { nft, from, to } => move_nft(&ctx, &nft, from, to).await,
        Commands::Init => init(&ctx).await,
        Commands::Balance { address } => balance(&ctx, address.as_deref()).await,
        Commands::Airdrop { sol } => airdrop(&ctx, &sol).await,
        Commands::Send { to, sol } => send(&ctx, &to, &sol).await,
        Commands::Transactions { address, limit } => {
            transactions(&ctx, address.as_deref(), limit).await
        }
        Commands::Tokens { address } => tokens(&ctx, address.as_deref()).await,
        Commands::Storage => storage(&ctx).await,
        Commands::Swap { shdw } => swap(&ctx, shdw).await,
        Commands::Settings { command } => settings(&ctx, command),
    }
}

fn format_asset(asset: &NftAsset) -> String {
    let price = asset
        .floor_price
        .as_ref()
        .map(|f| format!("{:.2} {}", f.price, f.currency))
        .unwrap_or_else(|| "-".into());
    format!("  {}  {}  [{price}]", asset.address, asset.name)
}

async fn nfts(ctx: &AppContext, owner: &str) -> Result<()> {
    let owner = parse_pubkey(owner)?;
    let viewer = match ctx.keypair() {
        Ok(kp) => Some(kp.pubkey()),
        Err(e) => {
            debug!("no local wallet: {e:#}");
            None
        }
    };

    let source = ctx.nft_source()?;
    let assets = source
        .owned_assets(&owner)
        .await
        .with_context(|| format!("failed to list NFTs from {}", source.name()))?;

    let document = match ctx.read_only_reconciler()?.load_filter(&owner).await {
        Ok(state) => state.document,
        Err(e) => {
            warn!("filter unavailable for {owner}: {e}");
            eprintln!("warning: filter unavailable ({e}); showing everything as junk");
            None
        }
    };

    let gallery = gallery::build(assets, document.as_ref(), &owner, viewer.as_ref());
    if gallery.view_only {
        println!("{owner} (view only)");
    } else {
        println!("{owner}");
    }
    for bucket in Bucket::ALL {
        let items = gallery.bucket(bucket);
        println!("{bucket} ({})", items.len());
        for asset in items {
            println!("{}", format_asset(asset));
        }
    }
    if gallery.hidden > 0 {
        println!("{} ungrouped NFTs hidden", gallery.hidden);
    }
    Ok(())
}

async fn filter_show(ctx: &AppContext, owner: &str) -> Result<()> {
    let owner = parse_pubkey(owner)?;
    let state = ctx.read_only_reconciler()?.load_filter(&owner).await?;
    let (Some(pointer), Some(document)) = (state.pointer, state.document) else {
        println!("no filter anchored for {owner}");
        return Ok(());
    };

    println!("url:  {}", pointer.url);
    println!("hash: {}", pointer.hash);
    match pointer.origin {
        PointerOrigin::Memo { signature, slot } => {
            println!("from: memo in {signature} (slot {slot})")
        }
        PointerOrigin::Program { account } => println!("from: account {account}"),
    }
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

async fn filter_set_url(ctx: &AppContext, url: &str) -> Result<()> {
    let keypair = ctx.keypair()?;
    let reconciler = ctx.read_only_reconciler()?;
    let (hash, signature) = reconciler.set_filter_url(&keypair, url).await?;
    println!("anchored {url}");
    println!("hash: {hash}");
    println!("tx:   {signature}");
    Ok(())
}

async fn move_nft(ctx: &AppContext, nft: &str, from: Bucket, to: Bucket) -> Result<()> {
    parse_pubkey(nft)?;
    let keypair = Arc::new(ctx.keypair()?);
    let reconciler = ctx.writing_reconciler(keypair.clone())?;
    let outcome = reconciler.move_item(&keypair, nft, from, to).await?;

    println!("moved {nft}: {from} -> {to}");
    println!("url:  {}", outcome.url);
    println!("hash: {}", outcome.hash);
    match outcome.signature {
        Some(sig) => println!("tx:   {sig}"),
        None => println!("pointer already current"),
    }
    Ok(())
}

async fn init(ctx: &AppContext) -> Result<()> {
    let keypair = ctx.keypair()?;
    match ctx.read_only_reconciler()?.init(&keypair).await? {
        Some(sig) => println!("filter account initialized: {sig}"),
        None => println!("nothing to initialize"),
    }
    Ok(())
}

/// The given address, or the configured wallet's.
fn address_or_wallet(ctx: &AppContext, address: Option<&str>) -> Result<Pubkey> {
    match address {
        Some(a) => parse_pubkey(a),
        None => Ok(ctx.keypair()?.pubkey()),
    }
}

async fn balance(ctx: &AppContext, address: Option<&str>) -> Result<()> {
    let address = address_or_wallet(ctx, address)?;
    let lamports = ctx.rpc.get_balance(&address).await?;
    println!("{address}: {} SOL", format_sol(lamports));
    Ok(())
}

async fn airdrop(ctx: &AppContext, sol: &str) -> Result<()> {
    let lamports = parse_sol(sol)?;
    let address = ctx.keypair()?.pubkey();
    let signature = ctx.rpc.request_airdrop(&address, lamports).await?;
    ctx.rpc
        .confirm_transaction(&signature, ctx.confirm_timeout())
        .await?;
    println!("airdropped {} SOL to {address}: {signature}", format_sol(lamports));
    Ok(())
}

async fn send(ctx: &AppContext, to: &str, sol: &str) -> Result<()> {
    let to = parse_pubkey(to)?;
    let lamports = parse_sol(sol)?;
    let keypair = ctx.keypair()?;
    let signature =
        wallet::transfer_sol(&ctx.rpc, &keypair, &to, lamports, ctx.confirm_timeout()).await?;
    println!("sent {} SOL to {to}: {signature}", format_sol(lamports));
    Ok(())
}

async fn transactions(ctx: &AppContext, address: Option<&str>, limit: usize) -> Result<()> {
    if !(1..=1000).contains(&limit) {
        bail!("--limit must be between 1 and 1000, got {limit}");
    }
    let address = address_or_wallet(ctx, address)?;
    let rows = wallet::recent_transactions(&ctx.rpc, &address, limit).await?;
    if rows.is_empty() {
        println!("no transactions for {address}");
        return Ok(());
    }
    for row in rows {
        let time = row
            .block_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        let status = if row.failed { "failed" } else { "success" };
        println!("{}  slot {}  {time}  {status}", row.signature, row.slot);
    }
    Ok(())
}

async fn tokens(ctx: &AppContext, address: Option<&str>) -> Result<()> {
    let address = address_or_wallet(ctx, address)?;
    let accounts = wallet::token_accounts(&ctx.rpc, &address).await?;
    if accounts.is_empty() {
        println!("no token accounts for {address}");
        return Ok(());
    }
    for account in accounts {
        println!("{}  mint {}  {}", account.address, account.mint, account.ui_amount);
    }
    Ok(())
}

async fn storage(ctx: &AppContext) -> Result<()> {
    let keypair = Arc::new(ctx.keypair()?);
    let accounts = ctx.storage_accounts(keypair)?.owned().await?;
    if accounts.is_empty() {
        println!(
            "no storage accounts; one named `{}` is created on the first filter upload",
            ctx.config.storage.identifier
        );
        return Ok(());
    }
    for account in accounts {
        let flag = if account.writable() { "" } else { "  (read-only)" };
        println!("{}  {}{flag}", account.address, account.identifier);
    }
    Ok(())
}

async fn swap(ctx: &AppContext, shdw: f64) -> Result<()> {
    let keypair = ctx.keypair()?;
    let cfg = &ctx.config.swap;
    let jupiter = JupiterClient::new(
        cfg.quote_url.clone(),
        cfg.swap_url.clone(),
        cfg.slippage_bps,
        cfg.priority_micro_lamports,
    );
    let signature = jupiter
        .swap_sol_for_shdw(&ctx.rpc, &keypair, shdw, ctx.confirm_timeout())
        .await?;
    println!("swapped SOL for {shdw} SHDW: {signature}");
    Ok(())
}

fn settings(ctx: &AppContext, command: SettingsCommand) -> Result<()> {
    match command {
        SettingsCommand::Get { key } => match ctx.db.get_setting(&key)? {
            Some(value) => println!("{value}"),
            None => println!("{key} is not set"),
        },
        SettingsCommand::Set { key, value } => {
            ctx.db.set_setting(&key, &value)?;
            println!("{key} = {value}");
        }
        SettingsCommand::Unset { key } => {
            if ctx.db.unset_setting(&key)? {
                println!("{key} removed");
            } else {
                println!("{key} was not set");
            }
        }
        SettingsCommand::List => {
            for (key, value) in ctx.db.list_settings()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}
