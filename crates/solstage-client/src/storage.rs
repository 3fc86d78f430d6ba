// Filter document hosting on Shadow Drive.
//
// Requests are authorized by an ed25519 signature (base58) over a fixed-form
// text message naming the storage account and the content being written.
//
// Storage accounts are found by scanning the Shadow Drive program for
// StorageAccountV2 records owned by the wallet, and created by sending the
// endpoint an owner-signed `initialize_account2` transaction that the
// endpoint co-signs as uploader.
//
// StorageAccountV2 layout:
//   [0..8)    account discriminator
//   [8]       immutable
//   [9]       to_be_deleted
//   [10..14)  delete_request_epoch, u32
//   [14..22)  reserved bytes, u64
//   [22..54)  owner
//   [54..58)  account counter seed, u32
//   [58..62)  creation time, u32 unix seconds
//   [62..70)  creation and last-fee epochs
//   [70..74)  identifier length, u32
//   [74..)    identifier bytes (UTF-8)

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use solstage_core::account::discriminator;
use solstage_core::hash::sha256_hex;
use solstage_core::keys::{
    associated_token_address, find_program_address, KeyError, Keypair, Pubkey,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rpc::{AccountFilter, RpcClient, RpcError};
use crate::tx::{AccountMeta, Instruction, Message, Transaction, TxError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("storage response did not include a file location")]
    NoLocation,

    #[error("no storage account available for writes")]
    NoAccount,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("malformed storage account {account}: {reason}")]
    BadAccount { account: String, reason: String },
}

/// Somewhere a named document can be written and later fetched by URL.
#[async_trait]
pub trait FilterStore: Send + Sync {
    /// Names of the files already stored.
    async fn list(&self) -> Result<Vec<String>, StorageError>;

    /// Store a new file. Returns its public URL.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    /// Replace an existing file. Returns its public URL.
    async fn edit(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    /// Upload or edit, depending on whether `name` exists.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        if self.list().await?.iter().any(|k| k == name) {
            debug!("{name} exists, editing");
            self.edit(name, bytes).await
        } else {
            debug!("{name} is new, uploading");
            self.upload(name, bytes).await
        }
    }
}

/// Stand-in for read-only use: every write fails with `NoAccount`.
pub struct UnconfiguredStore;

#[async_trait]
impl FilterStore for UnconfiguredStore {
    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::NoAccount)
    }

    async fn upload(&self, _name: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
        Err(StorageError::NoAccount)
    }

    async fn edit(&self, _name: &str, _bytes: Vec<u8>) -> Result<String, StorageError> {
        Err(StorageError::NoAccount)
    }
}

// ---------------------------------------------------------------------------
// Shadow Drive
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    finalized_locations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    #[serde(default)]
    finalized_location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    keys: Vec<String>,
}

pub fn upload_message(storage_account: &Pubkey, file_names: &[&str]) -> String {
    format!(
        "Shadow Drive Signed Message:\nStorage Account: {storage_account}\nUpload files with hash: {}",
        sha256_hex(file_names.join(",").as_bytes())
    )
}

pub fn edit_message(storage_account: &Pubkey, name: &str, content: &[u8]) -> String {
    format!(
        "Shadow Drive Signed Message:\n StorageAccount: {storage_account}\nFile to edit: {name}\nNew file hash: {}",
        sha256_hex(content)
    )
}

pub struct ShadowDriveStore {
    http: reqwest::Client,
    endpoint: String,
    public_base_url: String,
    storage_account: Pubkey,
    keypair: Arc<Keypair>,
}

impl ShadowDriveStore {
    pub fn new(
        endpoint: impl Into<String>,
        public_base_url: impl Into<String>,
        storage_account: Pubkey,
        keypair: Arc<Keypair>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            storage_account,
            keypair,
        }
    }

    /// Where `name` is served from once written.
    pub fn public_url(&self, name: &str) -> String {
        format!("{}/{}/{name}", self.public_base_url, self.storage_account)
    }

    fn file_part(name: &str, bytes: Vec<u8>) -> Result<Part, StorageError> {
        Ok(Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/json")?)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StorageError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl FilterStore for ShadowDriveStore {
    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let request = self
            .http
            .post(format!("{}/list-objects", self.endpoint))
            .json(&json!({ "storageAccount": self.storage_account.to_string() }));
        let listing: ListResponse = self.send(request).await?.json().await?;
        Ok(listing.keys)
    }

    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let message = upload_message(&self.storage_account, &[name]);
        let form = Form::new()
            .part("file", Self::file_part(name, bytes)?)
            .text("message", self.keypair.sign_b58(message.as_bytes()))
            .text("signer", self.keypair.pubkey().to_string())
            .text("storage_account", self.storage_account.to_string())
            .text("fileNames", name.to_string());

        let request = self.http.post(format!("{}/upload", self.endpoint)).multipart(form);
        let uploaded: UploadResponse = self.send(request).await?.json().await?;
        let url = uploaded
            .finalized_locations
            .into_iter()
            .next()
            .ok_or(StorageError::NoLocation)?;
        info!("uploaded {name} to {url}");
        Ok(url)
    }

    async fn edit(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let message = edit_message(&self.storage_account, name, &bytes);
        let form = Form::new()
            .part("file", Self::file_part(name, bytes)?)
            .text("signer", self.keypair.pubkey().to_string())
            .text("message", self.keypair.sign_b58(message.as_bytes()))
            .text("storage_account", self.storage_account.to_string())
            .text("url", self.public_url(name));

        let request = self.http.post(format!("{}/edit", self.endpoint)).multipart(form);
        let edited: EditResponse = self.send(request).await?.json().await?;
        let url = edited.finalized_location.ok_or(StorageError::NoLocation)?;
        info!("edited {name} at {url}");
        Ok(url)
    }
}

// ---------------------------------------------------------------------------
// Storage accounts
// ---------------------------------------------------------------------------

const OWNER_OFFSET: usize = 22;
const COUNTER_OFFSET: usize = 54;
const CREATED_OFFSET: usize = 58;
const IDENTIFIER_OFFSET: usize = 70;

/// The parts of a StorageAccountV2 record we read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccount {
    pub address: Pubkey,
    pub owner: Pubkey,
    pub identifier: String,
    pub immutable: bool,
    pub to_be_deleted: bool,
    pub created_at: u32,
}

pub fn storage_account_discriminator() -> [u8; 8] {
    discriminator("account", "StorageAccountV2")
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

impl StorageAccount {
    pub fn decode(address: Pubkey, data: &[u8]) -> Result<Self, StorageError> {
        let bad = |reason: &str| StorageError::BadAccount {
            account: address.to_string(),
            reason: reason.to_string(),
        };
        if data.get(..8) != Some(storage_account_discriminator().as_slice()) {
            return Err(bad("not a StorageAccountV2"));
        }
        let owner: [u8; 32] = data
            .get(OWNER_OFFSET..OWNER_OFFSET + 32)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| bad("truncated owner"))?;
        let created_at = read_u32(data, CREATED_OFFSET).ok_or_else(|| bad("truncated header"))?;
        let len = read_u32(data, IDENTIFIER_OFFSET).ok_or_else(|| bad("truncated identifier"))? as usize;
        let start = IDENTIFIER_OFFSET + 4;
        let raw = data
            .get(start..start + len)
            .ok_or_else(|| bad("identifier runs past the end"))?;
        let identifier = String::from_utf8(raw.to_vec()).map_err(|_| bad("identifier is not UTF-8"))?;
        Ok(StorageAccount {
            address,
            owner: Pubkey::new(owner),
            identifier,
            immutable: data[8] != 0,
            to_be_deleted: data[9] != 0,
            created_at,
        })
    }

    /// Whether new files can be written to the account.
    pub fn writable(&self) -> bool {
        !self.immutable && !self.to_be_deleted
    }
}

/// Borsh-encoded `initialize_account2(identifier, storage)` data.
pub fn encode_initialize_account(identifier: &str, size: u64) -> Vec<u8> {
    let mut out = discriminator("global", "initialize_account2").to_vec();
    out.extend_from_slice(&(identifier.len() as u32).to_le_bytes());
    out.extend_from_slice(identifier.as_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

#[derive(Debug, Deserialize)]
struct CreateAccountResponse {
    shdw_bucket: String,
    #[serde(default)]
    transaction_signature: Option<String>,
}

/// Finds or creates the wallet's storage account by name.
pub struct StorageAccounts {
    http: reqwest::Client,
    rpc: Arc<RpcClient>,
    endpoint: String,
    program_id: Pubkey,
    uploader: Pubkey,
    keypair: Arc<Keypair>,
}

impl StorageAccounts {
    pub fn new(
        rpc: Arc<RpcClient>,
        endpoint: impl Into<String>,
        program_id: Pubkey,
        uploader: Pubkey,
        keypair: Arc<Keypair>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            program_id,
            uploader,
            keypair,
        }
    }

    /// Every storage account owned by the wallet, oldest first.
    pub async fn owned(&self) -> Result<Vec<StorageAccount>, StorageError> {
        let owner = self.keypair.pubkey();
        let raw = self
            .rpc
            .get_program_accounts(
                &self.program_id,
                &[
                    AccountFilter::Memcmp {
                        offset: 0,
                        bytes: storage_account_discriminator().to_vec(),
                    },
                    AccountFilter::Memcmp {
                        offset: OWNER_OFFSET,
                        bytes: owner.to_bytes().to_vec(),
                    },
                ],
            )
            .await?;
        let mut accounts = Vec::with_capacity(raw.len());
        for (address, info) in raw {
            match StorageAccount::decode(address, &info.data) {
                Ok(account) => accounts.push(account),
                Err(e) => warn!("skipping storage account: {e}"),
            }
        }
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    /// The oldest writable account named `identifier`.
    pub async fn find(&self, identifier: &str) -> Result<Option<Pubkey>, StorageError> {
        Ok(self
            .owned()
            .await?
            .into_iter()
            .find(|a| a.identifier == identifier && a.writable())
            .map(|a| a.address))
    }

    /// Counter the program will use as the next storage account seed.
    async fn next_counter(&self, owner: &Pubkey) -> Result<u32, StorageError> {
        let (user_info, _) = find_program_address(
            &[b"user-info".as_slice(), owner.as_bytes().as_slice()],
            &self.program_id,
        )?;
        let Some(info) = self.rpc.get_account_info(&user_info).await? else {
            return Ok(0);
        };
        read_u32(&info.data, 8).ok_or_else(|| StorageError::BadAccount {
            account: user_info.to_string(),
            reason: "truncated user info".into(),
        })
    }

    /// The `initialize_account2` instruction for the account at `counter`.
    /// Returns the new account's address with it.
    pub fn create_instruction(
        &self,
        identifier: &str,
        size: u64,
        counter: u32,
    ) -> Result<(Pubkey, Instruction), StorageError> {
        let owner = self.keypair.pubkey();
        let program = &self.program_id;
        let (storage_config, _) = find_program_address(&[b"storage-config".as_slice()], program)?;
        let (user_info, _) =
            find_program_address(&[b"user-info".as_slice(), owner.as_bytes().as_slice()], program)?;
        let counter_seed = counter.to_le_bytes();
        let (storage_account, _) = find_program_address(
            &[b"storage-account".as_slice(), owner.as_bytes().as_slice(), counter_seed.as_slice()],
            program,
        )?;
        let (stake_account, _) = find_program_address(
            &[b"stake-account".as_slice(), storage_account.as_bytes().as_slice()],
            program,
        )?;
        let mint = Pubkey::shdw_mint();
        let owner_tokens = associated_token_address(&owner, &mint, &Pubkey::token_program())?;

        let instruction = Instruction {
            program_id: *program,
            accounts: vec![
                AccountMeta::writable(storage_config, false),
                AccountMeta::writable(user_info, false),
                AccountMeta::writable(storage_account, false),
                AccountMeta::writable(stake_account, false),
                AccountMeta::readonly(mint, false),
                AccountMeta::writable(owner, true),
                AccountMeta::readonly(self.uploader, true),
                AccountMeta::writable(owner_tokens, false),
                AccountMeta::readonly(Pubkey::system_program(), false),
                AccountMeta::readonly(Pubkey::token_program(), false),
                AccountMeta::readonly(Pubkey::rent_sysvar(), false),
            ],
            data: encode_initialize_account(identifier, size),
        };
        Ok((storage_account, instruction))
    }

    /// Create a storage account named `identifier` reserving `size` bytes.
    /// The endpoint adds the uploader signature and submits it.
    pub async fn create(&self, identifier: &str, size: u64) -> Result<Pubkey, StorageError> {
        let owner = self.keypair.pubkey();
        let counter = self.next_counter(&owner).await?;
        let (derived, instruction) = self.create_instruction(identifier, size, counter)?;

        let blockhash = self.rpc.get_latest_blockhash().await?;
        let message = Message::compile(&owner, &[instruction], &blockhash)?;
        let mut tx = Transaction::new(message);
        tx.sign(&self.keypair)?;

        let response = self
            .http
            .post(format!("{}/storage-account", self.endpoint))
            .json(&json!({ "transaction": tx.to_base64_partial() }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let created: CreateAccountResponse = response.json().await?;
        let bucket: Pubkey = created.shdw_bucket.parse()?;
        if bucket != derived {
            warn!("endpoint created {bucket}, expected {derived}");
        }
        info!(
            "created storage account {bucket} ({identifier}, {size} bytes) in {}",
            created.transaction_signature.as_deref().unwrap_or("unknown transaction")
        );
        Ok(bucket)
    }

    /// The account named `identifier`, creating it with `size` bytes when absent.
    pub async fn find_or_create(&self, identifier: &str, size: u64) -> Result<Pubkey, StorageError> {
        if let Some(account) = self.find(identifier).await? {
            debug!("using storage account {account} ({identifier})");
            return Ok(account);
        }
        info!("no storage account named {identifier}, creating one");
        self.create(identifier, size).await
    }
}

/// A Shadow Drive store whose account is looked up by name, and created
/// if missing, the first time it is used.
pub struct NamedAccountStore {
    accounts: StorageAccounts,
    identifier: String,
    initial_size: u64,
    public_base_url: String,
    resolved: tokio::sync::OnceCell<ShadowDriveStore>,
}

impl NamedAccountStore {
    pub fn new(
        accounts: StorageAccounts,
        identifier: impl Into<String>,
        initial_size: u64,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            accounts,
            identifier: identifier.into(),
            initial_size,
            public_base_url: public_base_url.into(),
            resolved: tokio::sync::OnceCell::new(),
        }
    }

    async fn store(&self) -> Result<&ShadowDriveStore, StorageError> {
        self.resolved
            .get_or_try_init(|| async {
                let account = self
                    .accounts
                    .find_or_create(&self.identifier, self.initial_size)
                    .await?;
                Ok::<_, StorageError>(ShadowDriveStore::new(
                    self.accounts.endpoint.clone(),
                    self.public_base_url.clone(),
                    account,
                    self.accounts.keypair.clone(),
                ))
            })
            .await
    }
}

#[async_trait]
impl FilterStore for NamedAccountStore {
    async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.store().await?.list().await
    }

    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        self.store().await?.upload(name, bytes).await
    }

    async fn edit(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        self.store().await?.edit(name, bytes).await
    }
}
