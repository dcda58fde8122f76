//! JSON-RPC ledger: `query_state()` reads, block numbers, receipts.
//!
//! Implements [Ledger] over raw JSON-RPC via HTTP. Transaction signing and
//! broadcast are out of scope; submission stays behind the [Submitter]
//! trait.
//!
//! [Submitter]: crate::reconciler::Submitter

use crate::abi::{decode_state_return, parse_hex_bytes, parse_hex_u64, selector, QUERY_STATE_SIG};
use crate::game::GameSnapshot;
use crate::hand::{Address, Hash32};
use crate::reconciler::{BlockTag, Ledger, LedgerError};
use serde_json::{json, Value};

fn block_tag_param(tag: BlockTag) -> Value {
    match tag {
        BlockTag::Pending => Value::String("pending".to_string()),
        BlockTag::Number(n) => Value::String(format!("0x{:x}", n)),
    }
}

async fn http_json_rpc(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
    id: u64,
) -> Result<Value, LedgerError> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    });
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| LedgerError::Rpc(e.to_string()))?;
    let json: Value = resp
        .json()
        .await
        .map_err(|e| LedgerError::Decode(e.to_string()))?;
    if let Some(err) = json.get("error") {
        return Err(LedgerError::Rpc(err.to_string()));
    }
    json.get("result")
        .cloned()
        .ok_or_else(|| LedgerError::Decode("missing result".to_string()))
}

/// Ledger over HTTP JSON-RPC. Confirmed block = head minus the configured
/// confirmation depth.
pub struct EthLedger {
    http_client: reqwest::Client,
    http_url: String,
    query_state_selector: [u8; 4],
    confirmations: u64,
}

impl EthLedger {
    pub fn new(http_url: impl Into<String>, confirmations: u64) -> Result<Self, LedgerError> {
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(Self {
            http_client,
            http_url: http_url.into(),
            query_state_selector: selector(QUERY_STATE_SIG),
            confirmations,
        })
    }

    /// Latest (head) block number.
    pub async fn block_number(&self) -> Result<u64, LedgerError> {
        let result = http_json_rpc(
            &self.http_client,
            &self.http_url,
            "eth_blockNumber",
            json!([]),
            1,
        )
        .await?;
        let s = result
            .as_str()
            .ok_or_else(|| LedgerError::Decode("blockNumber not string".to_string()))?;
        parse_hex_u64(s).map_err(|e| LedgerError::Decode(e.to_string()))
    }

    /// Head minus the confirmation depth.
    pub async fn confirmed_block(&self) -> Result<u64, LedgerError> {
        Ok(self.block_number().await?.saturating_sub(self.confirmations))
    }

    /// Raw transaction receipt, None if not yet mined.
    pub async fn transaction_receipt(
        &self,
        tx_hash: &Hash32,
    ) -> Result<Option<Value>, LedgerError> {
        let result = http_json_rpc(
            &self.http_client,
            &self.http_url,
            "eth_getTransactionReceipt",
            json!([format!("0x{}", hex::encode(tx_hash))]),
            2,
        )
        .await?;
        Ok(if result.is_null() { None } else { Some(result) })
    }
}

impl Ledger for EthLedger {
    async fn query(&self, contract: Address, tag: BlockTag) -> Result<GameSnapshot, LedgerError> {
        let params = json!([{
            "to": format!("0x{}", hex::encode(contract)),
            "data": format!("0x{}", hex::encode(self.query_state_selector)),
        }, block_tag_param(tag)]);
        let result = http_json_rpc(&self.http_client, &self.http_url, "eth_call", params, 3).await?;
        let s = result
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_call result not string".to_string()))?;
        let bytes = parse_hex_bytes(s).map_err(|e| LedgerError::Decode(e.to_string()))?;
        decode_state_return(&bytes).map_err(|e| LedgerError::Decode(e.to_string()))
    }
}
