// Integration tests for pointer reconciliation.
//
// A single wiremock server plays both the Solana RPC node (POST /) and the
// document host (GET /docs/...). Storage is an in-memory FilterStore and the
// local cache an in-memory database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use solstage_app::reconcile::{FilterError, PointerOrigin, PointerSettings, Reconciler};
use solstage_client::rpc::RpcClient;
use solstage_client::storage::{FilterStore, StorageError, UnconfiguredStore};
use solstage_core::account::{discriminator, FilterSourceAccount};
use solstage_core::config::PointerSource;
use solstage_core::db::{CachedFilter, Database};
use solstage_core::filter::{address_key, Bucket, FilterDocument};
use solstage_core::hash::{sha256, sha256_hex};
use solstage_core::keys::{filter_source_pda, Keypair, Pubkey};
use solstage_core::memo::{join_memo_field, PointerPayload, SignedPayload};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ===========================================================================
// Test helpers
// ===========================================================================

const BLOCKHASH: &str = "11111111111111111111111111111111";
const FILE_NAME: &str = "default-filter.json";

fn owner_keypair() -> Keypair {
    Keypair::from_secret([21u8; 32])
}

fn stranger_keypair() -> Keypair {
    Keypair::from_secret([22u8; 32])
}

/// A FilterStore that keeps files in memory and serves them from `base`.
/// Records whether each write was an upload or an edit.
struct MemoryStore {
    base: String,
    files: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<Vec<&'static str>>,
}

impl MemoryStore {
    fn new(base: &str) -> Self {
        Self {
            base: base.to_string(),
            files: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn with_file(self, name: &str, bytes: Vec<u8>) -> Self {
        self.files.lock().unwrap().insert(name.to_string(), bytes);
        self
    }

    fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(name).cloned()
    }

    fn writes(&self) -> Vec<&'static str> {
        self.writes.lock().unwrap().clone()
    }

    fn write(&self, name: &str, bytes: Vec<u8>) -> String {
        self.files.lock().unwrap().insert(name.to_string(), bytes);
        format!("{}/{name}", self.base)
    }
}

#[async_trait]
impl FilterStore for MemoryStore {
    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        self.writes.lock().unwrap().push("upload");
        Ok(self.write(name, bytes))
    }

    async fn edit(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        self.writes.lock().unwrap().push("edit");
        Ok(self.write(name, bytes))
    }
}

fn reconciler(
    server: &MockServer,
    source: PointerSource,
    store: Arc<dyn FilterStore>,
    db: Arc<Database>,
) -> Reconciler {
    let rpc = RpcClient::new(server.uri(), "confirmed").with_poll_interval(Duration::from_millis(5));
    Reconciler::new(
        Arc::new(rpc),
        store,
        db,
        PointerSettings {
            source,
            program_id: Pubkey::filter_program(),
            scan_limit: 100,
            max_slot_age: 0,
        },
        FILE_NAME,
        Duration::from_secs(5),
    )
}

fn memory_db() -> Arc<Database> {
    Arc::new(Database::open(":memory:").unwrap())
}

async fn mock_rpc(server: &MockServer, rpc_method: &str, result: Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": rpc_method })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result })),
        )
        .mount(server)
        .await;
}

async fn mock_transaction(server: &MockServer, signature: &str, slot: u64, signer: &Pubkey, failed: bool) {
    let err = if failed { json!({ "InstructionError": [0, "Custom"] }) } else { Value::Null };
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "getTransaction", "params": [signature] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {
                "slot": slot,
                "transaction": {
                    "message": {
                        "accountKeys": [
                            { "pubkey": signer.to_string(), "signer": true, "writable": true },
                            { "pubkey": "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr", "signer": false, "writable": false }
                        ]
                    },
                    "signatures": [signature]
                },
                "meta": { "err": err },
                "blockTime": 1_700_000_000
            }
        })))
        .mount(server)
        .await;
}

async fn mock_document(server: &MockServer, doc_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(doc_path))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// The RPC calls of a successful send: slot, blockhash, submit, confirm.
async fn mock_send_path(server: &MockServer, signature: &str) {
    mock_rpc(server, "getSlot", json!(500)).await;
    mock_rpc(
        server,
        "getLatestBlockhash",
        json!({ "context": { "slot": 500 }, "value": { "blockhash": BLOCKHASH, "lastValidBlockHeight": 600 } }),
    )
    .await;
    mock_rpc(server, "sendTransaction", json!(signature)).await;
    mock_rpc(
        server,
        "getSignatureStatuses",
        json!({
            "context": { "slot": 501 },
            "value": [{ "slot": 500, "confirmations": 1, "err": null, "confirmationStatus": "confirmed" }]
        }),
    )
    .await;
}

fn memo_field(keypair: &Keypair, url: &str, hash: &str, block_slot: u64) -> String {
    let signed = SignedPayload::sign(PointerPayload::new(url, hash, block_slot), keypair);
    join_memo_field(&signed.memos())
}

fn signature_entry(signature: &str, slot: u64, memo: Option<String>, failed: bool) -> Value {
    let err = if failed { json!({ "InstructionError": [0, "Custom"] }) } else { Value::Null };
    json!({
        "signature": signature,
        "slot": slot,
        "err": err,
        "memo": memo,
        "blockTime": 1_700_000_000
    })
}

/// Decoded wire bytes of every transaction submitted to the mock node.
async fn sent_transactions(server: &MockServer) -> Vec<Vec<u8>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
        .filter(|body| body["method"] == "sendTransaction")
        .filter_map(|body| body["params"][0].as_str().map(str::to_string))
        .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64).unwrap())
        .collect()
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn staged_document(addresses: &[&str]) -> FilterDocument {
    FilterDocument {
        stage: addresses.iter().map(|a| address_key(a)).collect(),
        ..FilterDocument::empty()
    }
}

// ===========================================================================
// Memo pointers
// ===========================================================================

#[tokio::test]
async fn memo_scan_skips_invalid_candidates_and_picks_newest_valid() {
    let server = MockServer::start().await;
    let owner = owner_keypair();
    let stranger = stranger_keypair();
    let good_url = format!("{}/docs/good.json", server.uri());
    let hash = sha256_hex(b"{}");

    mock_rpc(
        &server,
        "getSignaturesForAddress",
        json!([
            // signed by someone else
            signature_entry("sigForged", 60, Some(memo_field(&stranger, "https://evil/x.json", &hash, 59)), false),
            // carrying transaction failed
            signature_entry("sigFailed", 55, Some(memo_field(&owner, "https://x/failed.json", &hash, 54)), true),
            // not a pointer memo at all
            signature_entry("sigChatter", 52, Some("[5] hello".to_string()), false),
            // owner signed the payload but not the transaction
            signature_entry("sigRelayed", 50, Some(memo_field(&owner, "https://x/relayed.json", &hash, 49)), false),
            // blockSlot after the transaction slot
            signature_entry("sigFuture", 45, Some(memo_field(&owner, "https://x/future.json", &hash, 100)), false),
            signature_entry("sigGood", 40, Some(memo_field(&owner, &good_url, &hash, 39)), false),
            signature_entry("sigOlder", 30, Some(memo_field(&owner, "https://x/older.json", &hash, 29)), false),
        ]),
    )
    .await;
    mock_transaction(&server, "sigRelayed", 50, &stranger.pubkey(), false).await;
    mock_transaction(&server, "sigFuture", 45, &owner.pubkey(), false).await;
    mock_transaction(&server, "sigGood", 40, &owner.pubkey(), false).await;
    mock_transaction(&server, "sigOlder", 30, &owner.pubkey(), false).await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let pointer = r.locate_pointer(&owner.pubkey()).await.unwrap().unwrap();

    assert_eq!(pointer.url, good_url);
    assert_eq!(pointer.hash, hash);
    assert_eq!(
        pointer.origin,
        PointerOrigin::Memo {
            signature: "sigGood".into(),
            slot: 40
        }
    );
}

#[tokio::test]
async fn memo_field_with_extra_memo_is_not_a_pointer() {
    let server = MockServer::start().await;
    let owner = owner_keypair();
    let hash = sha256_hex(b"{}");
    let signed = SignedPayload::sign(PointerPayload::new("https://x/padded.json", &hash, 49), &owner);
    let [payload, signature] = signed.memos();
    let padded = join_memo_field(&[payload, signature, "extra".to_string()]);

    mock_rpc(
        &server,
        "getSignaturesForAddress",
        json!([
            signature_entry("sigPadded", 50, Some(padded), false),
            signature_entry("sigPlain", 40, Some(memo_field(&owner, "https://x/plain.json", &hash, 39)), false),
        ]),
    )
    .await;
    mock_transaction(&server, "sigPadded", 50, &owner.pubkey(), false).await;
    mock_transaction(&server, "sigPlain", 40, &owner.pubkey(), false).await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let pointer = r.locate_pointer(&owner.pubkey()).await.unwrap().unwrap();
    assert_eq!(pointer.url, "https://x/plain.json");
    assert_eq!(
        pointer.origin,
        PointerOrigin::Memo {
            signature: "sigPlain".into(),
            slot: 40
        }
    );
}

#[tokio::test]
async fn memo_scan_without_pointer_yields_empty_state() {
    let server = MockServer::start().await;
    mock_rpc(&server, "getSignaturesForAddress", json!([])).await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let state = r.load_filter(&owner_keypair().pubkey()).await.unwrap();
    assert!(state.pointer.is_none());
    assert_eq!(state.document_or_empty(), FilterDocument::empty());
}

// ===========================================================================
// Program pointers
// ===========================================================================

#[tokio::test]
async fn program_pointer_reads_filter_source_account() {
    let server = MockServer::start().await;
    let owner = owner_keypair().pubkey();
    let (pda, _) = filter_source_pda(&owner, &Pubkey::filter_program()).unwrap();
    let account = FilterSourceAccount {
        hash: sha256(b"{}"),
        url: "https://shdw/acc/default-filter.json".into(),
    };

    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "getAccountInfo", "params": [pda.to_string()] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {
                "context": { "slot": 1 },
                "value": {
                    "lamports": 1_000_000,
                    "owner": Pubkey::filter_program().to_string(),
                    "data": [base64::engine::general_purpose::STANDARD.encode(account.encode()), "base64"],
                    "executable": false,
                    "rentEpoch": 0
                }
            }
        })))
        .mount(&server)
        .await;

    let r = reconciler(&server, PointerSource::Program, Arc::new(UnconfiguredStore), memory_db());
    let pointer = r.locate_pointer(&owner).await.unwrap().unwrap();
    assert_eq!(pointer.url, "https://shdw/acc/default-filter.json");
    assert_eq!(pointer.hash, sha256_hex(b"{}"));
    assert_eq!(pointer.origin, PointerOrigin::Program { account: pda });
}

#[tokio::test]
async fn missing_or_unset_account_means_no_pointer() {
    let server = MockServer::start().await;
    mock_rpc(&server, "getAccountInfo", json!({ "context": { "slot": 1 }, "value": null })).await;
    let r = reconciler(&server, PointerSource::Program, Arc::new(UnconfiguredStore), memory_db());
    assert!(r.locate_pointer(&owner_keypair().pubkey()).await.unwrap().is_none());

    let server = MockServer::start().await;
    let unset = FilterSourceAccount {
        hash: [0u8; 32],
        url: String::new(),
    };
    mock_rpc(
        &server,
        "getAccountInfo",
        json!({
            "context": { "slot": 1 },
            "value": {
                "lamports": 1,
                "owner": Pubkey::filter_program().to_string(),
                "data": [base64::engine::general_purpose::STANDARD.encode(unset.encode()), "base64"]
            }
        }),
    )
    .await;
    let r = reconciler(&server, PointerSource::Program, Arc::new(UnconfiguredStore), memory_db());
    assert!(r.locate_pointer(&owner_keypair().pubkey()).await.unwrap().is_none());
}

// ===========================================================================
// Loading documents
// ===========================================================================

async fn mount_single_pointer(server: &MockServer, url: &str, hash: &str) {
    let owner = owner_keypair();
    mock_rpc(
        server,
        "getSignaturesForAddress",
        json!([signature_entry("sigPtr", 40, Some(memo_field(&owner, url, hash, 39)), false)]),
    )
    .await;
    mock_transaction(server, "sigPtr", 40, &owner.pubkey(), false).await;
}

#[tokio::test]
async fn load_filter_verifies_and_caches_document() {
    let server = MockServer::start().await;
    let doc = staged_document(&["NftA"]);
    let content = doc.to_json();
    let url = format!("{}/docs/filter.json", server.uri());
    mount_single_pointer(&server, &url, &sha256_hex(content.as_bytes())).await;

    Mock::given(method("GET"))
        .and(path("/docs/filter.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(content.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let db = memory_db();
    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), db.clone());
    let owner = owner_keypair().pubkey();

    let first = r.load_filter(&owner).await.unwrap();
    assert_eq!(first.document, Some(doc.clone()));

    // Second load is served from the cache; the host mock expects one hit.
    let second = r.load_filter(&owner).await.unwrap();
    assert_eq!(second.document, Some(doc));

    let cached = db.load_filter(&owner.to_string()).unwrap().unwrap();
    assert_eq!(cached.url, url);
    assert_eq!(cached.content, content);
}

#[tokio::test]
async fn stale_cache_entry_is_refetched() {
    let server = MockServer::start().await;
    let content = staged_document(&["NftB"]).to_json();
    let hash = sha256_hex(content.as_bytes());
    let url = format!("{}/docs/filter.json", server.uri());
    mount_single_pointer(&server, &url, &hash).await;
    mock_document(&server, "/docs/filter.json", &content).await;

    let db = memory_db();
    let owner = owner_keypair().pubkey();
    db.save_filter(&CachedFilter {
        owner: owner.to_string(),
        url: url.clone(),
        hash: sha256_hex(b"older"),
        content: "{\"stage\":[]}".into(),
        verified_at: chrono::Utc::now(),
    })
    .unwrap();

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), db.clone());
    let state = r.load_filter(&owner).await.unwrap();
    assert_eq!(state.document, Some(staged_document(&["NftB"])));
    assert_eq!(db.load_filter(&owner.to_string()).unwrap().unwrap().hash, hash);
}

#[tokio::test]
async fn hash_mismatch_is_rejected() {
    let server = MockServer::start().await;
    let url = format!("{}/docs/filter.json", server.uri());
    mount_single_pointer(&server, &url, &sha256_hex(b"something else")).await;
    mock_document(&server, "/docs/filter.json", "{\"stage\":[\"a,Nft\"]}").await;

    let db = memory_db();
    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), db.clone());
    let owner = owner_keypair().pubkey();
    let err = r.load_filter(&owner).await.unwrap_err();
    assert!(matches!(err, FilterError::HashMismatch { .. }), "got {err}");
    assert!(db.load_filter(&owner.to_string()).unwrap().is_none());
}

#[tokio::test]
async fn blank_document_is_rejected() {
    let server = MockServer::start().await;
    let url = format!("{}/docs/filter.json", server.uri());
    mount_single_pointer(&server, &url, &sha256_hex(b"  \n")).await;
    mock_document(&server, "/docs/filter.json", "  \n").await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let err = r.load_filter(&owner_keypair().pubkey()).await.unwrap_err();
    assert!(matches!(err, FilterError::EmptyDocument { .. }), "got {err}");
}

#[tokio::test]
async fn unreachable_document_reports_status() {
    let server = MockServer::start().await;
    let url = format!("{}/docs/gone.json", server.uri());
    mount_single_pointer(&server, &url, &sha256_hex(b"{}")).await;
    Mock::given(method("GET"))
        .and(path("/docs/gone.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let err = r.load_filter(&owner_keypair().pubkey()).await.unwrap_err();
    assert!(matches!(err, FilterError::FetchStatus { status: 404, .. }), "got {err}");
}

// ===========================================================================
// Writing
// ===========================================================================

#[tokio::test]
async fn move_item_publishes_and_anchors_new_document() {
    let server = MockServer::start().await;
    mock_rpc(&server, "getSignaturesForAddress", json!([])).await;
    mock_send_path(&server, "sigNew").await;

    let store = Arc::new(MemoryStore::new("https://shdw/acc"));
    let db = memory_db();
    let r = reconciler(&server, PointerSource::Memo, store.clone(), db.clone());
    let keypair = owner_keypair();

    let outcome = r
        .move_item(&keypair, "NftA", Bucket::Junkbox, Bucket::Stage)
        .await
        .unwrap();

    assert_eq!(outcome.document, staged_document(&["NftA"]));
    assert_eq!(outcome.url, format!("https://shdw/acc/{FILE_NAME}"));
    assert_eq!(outcome.signature.as_deref(), Some("sigNew"));

    let stored = store.file(FILE_NAME).unwrap();
    assert_eq!(stored, outcome.document.to_json().into_bytes());
    assert_eq!(outcome.hash, sha256_hex(&stored));

    let sent = sent_transactions(&server).await;
    assert_eq!(sent.len(), 1);
    let payload = PointerPayload::new(&outcome.url, &outcome.hash, 500).render();
    assert!(contains_bytes(&sent[0], format!("Payload:{payload}").as_bytes()));
    assert!(contains_bytes(&sent[0], b"Signature:"));

    let cached = db.load_filter(&keypair.pubkey().to_string()).unwrap().unwrap();
    assert_eq!(cached.hash, outcome.hash);
    assert_eq!(cached.url, outcome.url);
}

#[tokio::test]
async fn move_item_edits_existing_document_and_reanchors() {
    let server = MockServer::start().await;
    let before = staged_document(&["NftA", "NftB"]).to_json();
    let base = format!("{}/docs", server.uri());
    let url = format!("{base}/{FILE_NAME}");
    mount_single_pointer(&server, &url, &sha256_hex(before.as_bytes())).await;
    mock_document(&server, &format!("/docs/{FILE_NAME}"), &before).await;
    mock_send_path(&server, "sigEdit").await;

    let store = Arc::new(MemoryStore::new(&base).with_file(FILE_NAME, before.clone().into_bytes()));
    let r = reconciler(&server, PointerSource::Memo, store.clone(), memory_db());

    let outcome = r
        .move_item(&owner_keypair(), "NftA", Bucket::Stage, Bucket::Backstage)
        .await
        .unwrap();

    assert_eq!(outcome.document.stage, vec!["a,NftB".to_string()]);
    assert_eq!(outcome.document.backstage, vec!["a,NftA".to_string()]);
    assert_eq!(outcome.signature.as_deref(), Some("sigEdit"));
    assert_eq!(outcome.url, url);
    assert_ne!(outcome.hash, sha256_hex(before.as_bytes()));

    assert_eq!(store.writes(), vec!["edit"]);
    assert_eq!(
        store.file(FILE_NAME).unwrap(),
        outcome.document.to_json().into_bytes()
    );

    let sent = sent_transactions(&server).await;
    assert_eq!(sent.len(), 1);
    let payload = PointerPayload::new(&outcome.url, &outcome.hash, 500).render();
    assert!(contains_bytes(&sent[0], format!("Payload:{payload}").as_bytes()));
}

#[tokio::test]
async fn unchanged_document_is_not_republished() {
    let server = MockServer::start().await;
    let doc = staged_document(&["NftA"]);
    let content = doc.to_json();
    let url = format!("{}/docs/filter.json", server.uri());
    mount_single_pointer(&server, &url, &sha256_hex(content.as_bytes())).await;
    mock_document(&server, "/docs/filter.json", &content).await;

    // The read-only store fails any write, so success proves nothing was put.
    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let outcome = r
        .move_item(&owner_keypair(), "NftA", Bucket::Stage, Bucket::Stage)
        .await
        .unwrap();
    assert_eq!(outcome.signature, None);
    assert_eq!(outcome.url, url);
    assert_eq!(outcome.document, doc);
    assert!(sent_transactions(&server).await.is_empty());
}

#[tokio::test]
async fn changed_document_needs_a_store() {
    let server = MockServer::start().await;
    mock_rpc(&server, "getSignaturesForAddress", json!([])).await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let err = r
        .move_item(&owner_keypair(), "NftA", Bucket::Junkbox, Bucket::Backstage)
        .await
        .unwrap_err();
    assert!(matches!(err, FilterError::Storage(StorageError::NoAccount)), "got {err}");
}

#[tokio::test]
async fn set_filter_url_initializes_program_account_and_anchors() {
    let server = MockServer::start().await;
    let content = staged_document(&["NftC"]).to_json();
    let url = format!("{}/docs/hosted.json", server.uri());
    mock_document(&server, "/docs/hosted.json", &content).await;
    mock_rpc(&server, "getAccountInfo", json!({ "context": { "slot": 1 }, "value": null })).await;
    mock_send_path(&server, "sigProgram").await;

    let db = memory_db();
    let keypair = owner_keypair();
    let r = reconciler(&server, PointerSource::Program, Arc::new(UnconfiguredStore), db.clone());
    let (hash, signature) = r.set_filter_url(&keypair, &url).await.unwrap();

    assert_eq!(hash, sha256_hex(content.as_bytes()));
    assert_eq!(signature, "sigProgram");

    let sent = sent_transactions(&server).await;
    assert_eq!(sent.len(), 1);
    assert!(contains_bytes(&sent[0], url.as_bytes()));
    assert!(contains_bytes(&sent[0], &sha256(content.as_bytes())));

    let cached = db.load_filter(&keypair.pubkey().to_string()).unwrap().unwrap();
    assert_eq!(cached.content, content);
}

#[tokio::test]
async fn set_filter_url_reuses_existing_program_account() {
    let server = MockServer::start().await;
    let content = staged_document(&["NftD"]).to_json();
    let url = format!("{}/docs/next.json", server.uri());
    mock_document(&server, "/docs/next.json", &content).await;

    let existing = FilterSourceAccount {
        hash: sha256(b"previous"),
        url: "https://shdw/acc/previous.json".into(),
    };
    mock_rpc(
        &server,
        "getAccountInfo",
        json!({
            "context": { "slot": 1 },
            "value": {
                "lamports": 1_000_000,
                "owner": Pubkey::filter_program().to_string(),
                "data": [base64::engine::general_purpose::STANDARD.encode(existing.encode()), "base64"],
                "executable": false,
                "rentEpoch": 0
            }
        }),
    )
    .await;
    mock_send_path(&server, "sigSetOnly").await;

    let r = reconciler(&server, PointerSource::Program, Arc::new(UnconfiguredStore), memory_db());
    let (hash, signature) = r.set_filter_url(&owner_keypair(), &url).await.unwrap();
    assert_eq!(hash, sha256_hex(content.as_bytes()));
    assert_eq!(signature, "sigSetOnly");

    let sent = sent_transactions(&server).await;
    assert_eq!(sent.len(), 1);
    assert!(contains_bytes(&sent[0], &discriminator("global", "set_filter")));
    assert!(!contains_bytes(&sent[0], &discriminator("global", "initialize")));
    assert!(contains_bytes(&sent[0], url.as_bytes()));
}

#[tokio::test]
async fn set_filter_url_rejects_non_filter_json() {
    let server = MockServer::start().await;
    let url = format!("{}/docs/nope.json", server.uri());
    mock_document(&server, "/docs/nope.json", "<html>not json</html>").await;

    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    let err = r.set_filter_url(&owner_keypair(), &url).await.unwrap_err();
    assert!(matches!(err, FilterError::Parse { .. }), "got {err}");
}

#[tokio::test]
async fn init_is_a_no_op_for_memo_pointers() {
    let server = MockServer::start().await;
    let r = reconciler(&server, PointerSource::Memo, Arc::new(UnconfiguredStore), memory_db());
    assert_eq!(r.init(&owner_keypair()).await.unwrap(), None);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}
