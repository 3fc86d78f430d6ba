// SOL -> SHDW swaps through the Jupiter v6 API, used to fund Shadow Drive
// storage.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use solstage_core::keys::{Keypair, Pubkey};
use thiserror::Error;
use tracing::info;

use crate::rpc::{RpcClient, RpcError};
use crate::tx::{sign_serialized, TxError};

pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const SHDW_MINT: &str = "SHDWyBxihqiCj6YekG2GUr7wqKLeLAMK1gHZck9pL6y";
const SHDW_DECIMALS: i32 = 9;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("swap amount must be a positive number of SHDW, got {0}")]
    BadAmount(f64),

    #[error("jupiter request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("jupiter returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("jupiter error: {0}")]
    Api(String),

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// A route quote. The raw JSON is echoed back to `/swap` unchanged.
#[derive(Debug, Clone)]
pub struct Quote {
    pub in_amount: u64,
    pub out_amount: u64,
    pub raw: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    #[serde(default)]
    swap_transaction: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// SHDW amount in base units.
pub fn shdw_base_units(shdw: f64) -> Result<u64, SwapError> {
    if !shdw.is_finite() || shdw <= 0.0 {
        return Err(SwapError::BadAmount(shdw));
    }
    Ok((shdw * 10f64.powi(SHDW_DECIMALS)).round() as u64)
}

fn amount_field(raw: &Value, field: &str) -> Result<u64, SwapError> {
    raw.get(field)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SwapError::Api(format!("quote has no numeric `{field}`")))
}

pub struct JupiterClient {
    http: reqwest::Client,
    quote_url: String,
    swap_url: String,
    slippage_bps: u32,
    priority_micro_lamports: u64,
}

impl JupiterClient {
    pub fn new(
        quote_url: impl Into<String>,
        swap_url: impl Into<String>,
        slippage_bps: u32,
        priority_micro_lamports: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            quote_url: quote_url.into(),
            swap_url: swap_url.into(),
            slippage_bps,
            priority_micro_lamports,
        }
    }

    async fn json_response(response: reqwest::Response) -> Result<Value, SwapError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SwapError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// Quote an exact-out swap of SOL for `shdw` SHDW.
    pub async fn quote(&self, shdw: f64) -> Result<Quote, SwapError> {
        let amount = shdw_base_units(shdw)?.to_string();
        let slippage = self.slippage_bps.to_string();
        let response = self
            .http
            .get(&self.quote_url)
            .query(&[
                ("inputMint", SOL_MINT),
                ("outputMint", SHDW_MINT),
                ("amount", amount.as_str()),
                ("slippageBps", slippage.as_str()),
                ("swapMode", "ExactOut"),
            ])
            .send()
            .await?;
        let raw = Self::json_response(response).await?;
        if let Some(err) = raw.get("error").and_then(Value::as_str) {
            return Err(SwapError::Api(err.to_string()));
        }
        Ok(Quote {
            in_amount: amount_field(&raw, "inAmount")?,
            out_amount: amount_field(&raw, "outAmount")?,
            raw,
        })
    }

    /// Ask Jupiter to build the (unsigned) swap transaction for `user`.
    pub async fn swap_transaction(&self, quote: &Quote, user: &Pubkey) -> Result<String, SwapError> {
        let mut body = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user.to_string(),
            "wrapAndUnwrapSol": true,
        });
        if self.priority_micro_lamports > 0 {
            body["computeUnitPriceMicroLamports"] = json!(self.priority_micro_lamports);
        }
        let response = self.http.post(&self.swap_url).json(&body).send().await?;
        let parsed: SwapResponse = serde_json::from_value(Self::json_response(response).await?)
            .map_err(|e| SwapError::Api(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(SwapError::Api(err));
        }
        parsed
            .swap_transaction
            .ok_or_else(|| SwapError::Api("response has no swapTransaction".into()))
    }

    /// Quote, sign, send and confirm. Returns the transaction signature.
    pub async fn swap_sol_for_shdw(
        &self,
        rpc: &RpcClient,
        keypair: &Keypair,
        shdw: f64,
        timeout: Duration,
    ) -> Result<String, SwapError> {
        let quote = self.quote(shdw).await?;
        info!(
            "swapping up to {} lamports for {} SHDW base units",
            quote.in_amount, quote.out_amount
        );
        let unsigned = self.swap_transaction(&quote, &keypair.pubkey()).await?;
        let signed = sign_serialized(&unsigned, keypair)?;
        let signature = rpc.send_transaction(&signed).await?;
        rpc.confirm_transaction(&signature, timeout).await?;
        info!("swap confirmed: {signature}");
        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{memo_instruction, Message, Transaction};
    use base64::Engine;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quote_json() -> Value {
        json!({
            "inputMint": SOL_MINT, "outputMint": SHDW_MINT,
            "inAmount": "12345678", "outAmount": "2500000000",
            "swapMode": "ExactOut", "slippageBps": 500, "routePlan": []
        })
    }

    fn client(server: &MockServer) -> JupiterClient {
        JupiterClient::new(
            format!("{}/v6/quote", server.uri()),
            format!("{}/v6/swap", server.uri()),
            500,
            5,
        )
    }

    #[test]
    fn base_units_scale_by_nine_decimals() {
        assert_eq!(shdw_base_units(2.5).unwrap(), 2_500_000_000);
        assert_eq!(shdw_base_units(0.000000001).unwrap(), 1);
        assert!(matches!(shdw_base_units(0.0), Err(SwapError::BadAmount(_))));
        assert!(matches!(shdw_base_units(f64::NAN), Err(SwapError::BadAmount(_))));
    }

    #[tokio::test]
    async fn quote_requests_exact_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v6/quote"))
            .and(query_param("inputMint", SOL_MINT))
            .and(query_param("outputMint", SHDW_MINT))
            .and(query_param("amount", "2500000000"))
            .and(query_param("slippageBps", "500"))
            .and(query_param("swapMode", "ExactOut"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_json()))
            .expect(1)
            .mount(&server)
            .await;

        let quote = client(&server).quote(2.5).await.unwrap();
        assert_eq!(quote.in_amount, 12_345_678);
        assert_eq!(quote.out_amount, 2_500_000_000);
    }

    #[tokio::test]
    async fn quote_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "no route" })))
            .mount(&server)
            .await;
        let err = client(&server).quote(1.0).await.unwrap_err();
        assert!(matches!(err, SwapError::Api(ref m) if m == "no route"));
    }

    #[tokio::test]
    async fn full_swap_signs_sends_and_confirms() {
        let server = MockServer::start().await;
        let kp = Keypair::from_secret([6u8; 32]);

        let msg = Message::compile(
            &kp.pubkey(),
            &[memo_instruction(&kp.pubkey(), "swap")],
            "11111111111111111111111111111111",
        )
        .unwrap();
        let unsigned = base64::engine::general_purpose::STANDARD.encode(Transaction::new(msg.clone()).serialize());
        let mut expected = Transaction::new(msg);
        expected.sign(&kp).unwrap();

        Mock::given(method("GET"))
            .and(path("/v6/quote"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_json()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v6/swap"))
            .and(body_partial_json(json!({
                "userPublicKey": kp.pubkey().to_string(),
                "computeUnitPriceMicroLamports": 5
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "swapTransaction": unsigned })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({
                "method": "sendTransaction",
                "params": [expected.to_base64().unwrap()]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": expected.signature().unwrap()
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({ "method": "getSignatureStatuses" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "result": { "context": { "slot": 1 }, "value": [{ "slot": 1, "err": null, "confirmationStatus": "confirmed" }] }
            })))
            .mount(&server)
            .await;

        let rpc = RpcClient::new(format!("{}/rpc", server.uri()), "confirmed");
        let sig = client(&server)
            .swap_sol_for_shdw(&rpc, &kp, 2.5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(sig, expected.signature().unwrap());
    }
}
