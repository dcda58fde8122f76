//! GameIndexer: follows factory `Created` logs and game-contract events.
//!
//! Subscribes via WebSocket, backfills via HTTP on startup/reconnect,
//! broadcasts decoded items ordered by (block_number, log_index). Decode
//! failures are dropped with a warning; they never abort the loop.

use crate::abi::{
    decode_creation_log, decode_game_log, GameCreation, ObservedEvent, TopicTable,
};
use crate::config::EngineConfig;
use crate::hand::Hash32;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// One decoded log from the chain: a factory creation or a game event.
#[derive(Debug, Clone)]
pub enum IndexedItem {
    Creation(GameCreation),
    Game(ObservedEvent),
}

fn topic_hex(topic: &Hash32) -> String {
    format!("0x{}", hex::encode(topic))
}

/// Filter on the factory address and `Created` topic.
fn build_creation_filter(
    config: &EngineConfig,
    table: &TopicTable,
    from_block: Option<u64>,
    to_block: Option<u64>,
) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(config.factory_address)),
        "topics": [topic_hex(table.created_topic())],
    });
    if let Some(from) = from_block {
        filter["fromBlock"] = Value::String(format!("0x{:x}", from));
    }
    if let Some(to) = to_block {
        filter["toBlock"] = Value::String(format!("0x{:x}", to));
    }
    filter
}

/// Topics-only filter for the four game events; game contract addresses are
/// not known up front, so consumers route by emitting address.
fn build_game_filter(table: &TopicTable, from_block: Option<u64>, to_block: Option<u64>) -> Value {
    let topics: Vec<String> = table.game_topics().iter().map(topic_hex).collect();
    let mut filter = json!({
        "topics": [topics],
    });
    if let Some(from) = from_block {
        filter["fromBlock"] = Value::String(format!("0x{:x}", from));
    }
    if let Some(to) = to_block {
        filter["toBlock"] = Value::String(format!("0x{:x}", to));
    }
    filter
}

async fn http_json_rpc(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Value,
    id: u64,
) -> Result<Value> {
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
        .context("HTTP request failed")?;
    let json: Value = resp.json().await.context("parse response")?;
    if let Some(err) = json.get("error") {
        anyhow::bail!("RPC error: {}", err);
    }
    json.get("result")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing result"))
}

async fn eth_block_number(client: &reqwest::Client, http_url: &str) -> Result<u64> {
    let result = http_json_rpc(client, http_url, "eth_blockNumber", json!([]), 1).await?;
    let s = result
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("blockNumber not string"))?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).context("parse block number")
}

async fn eth_get_logs(client: &reqwest::Client, http_url: &str, filter: Value) -> Result<Vec<Value>> {
    let result = http_json_rpc(client, http_url, "eth_getLogs", json!([filter]), 2).await?;
    let arr = result
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("getLogs not array"))?;
    Ok(arr.clone())
}

/// Game indexer: follows factory creations and game events, backfills via
/// HTTP, broadcasts decoded items.
pub struct GameIndexer {
    config: EngineConfig,
    table: TopicTable,
    event_tx: broadcast::Sender<IndexedItem>,
}

impl GameIndexer {
    pub fn new(config: EngineConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            table: TopicTable::new(),
            event_tx,
        }
    }

    /// Subscribe to decoded items (ordered by block_number, log_index within
    /// a backfill chunk).
    pub fn subscribe(&self) -> broadcast::Receiver<IndexedItem> {
        self.event_tx.subscribe()
    }

    /// Decode one raw log into an item, or None if the log is not ours
    /// (foreign topic, or a Created topic from a different factory).
    fn decode_item(&self, log: &Value) -> Option<IndexedItem> {
        let topic0 = log
            .get("topics")
            .and_then(|t| t.as_array())
            .and_then(|t| t.first())
            .and_then(|t| t.as_str())?;
        let topic0 = crate::abi::parse_hex_bytes_32(topic0).ok()?;
        if &topic0 == self.table.created_topic() {
            let address = log.get("address").and_then(|a| a.as_str())?;
            let address = crate::abi::parse_hex_bytes_20(address).ok()?;
            if address != self.config.factory_address {
                return None;
            }
            match decode_creation_log(&self.table, log) {
                Ok(creation) => Some(IndexedItem::Creation(creation)),
                Err(e) => {
                    tracing::warn!(reason = %e, "creation log dropped");
                    None
                }
            }
        } else if self.table.kind_of(&topic0).is_some() {
            match decode_game_log(&self.table, log) {
                Ok(observed) => Some(IndexedItem::Game(observed)),
                Err(e) => {
                    tracing::warn!(reason = %e, "game log dropped");
                    None
                }
            }
        } else {
            None
        }
    }

    /// Run the indexer (blocking on the async loop). Call from a spawned task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_client = reqwest::Client::new();
        let mut last_processed_block = self.config.creation_block.saturating_sub(1);
        let reconnection = self.config.reconnection.clone();

        loop {
            match run_once(Arc::clone(&self), &http_client, &mut last_processed_block).await {
                Ok(()) => {
                    sleep(Duration::from_secs(reconnection.initial_backoff_secs)).await;
                }
                Err(e) => {
                    tracing::warn!(reason = %e, "GameIndexer failed, reconnecting...");
                    let base = std::cmp::min(
                        Duration::from_secs(reconnection.initial_backoff_secs) * 2,
                        Duration::from_secs(reconnection.max_backoff_secs),
                    );
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
                    sleep(base + jitter).await;
                }
            }
        }
    }
}

async fn run_once(
    indexer: Arc<GameIndexer>,
    http_client: &reqwest::Client,
    last_processed_block: &mut u64,
) -> Result<()> {
    let config = &indexer.config;
    let from_block = *last_processed_block + 1;
    let tip = eth_block_number(http_client, &config.http_url).await?;
    if from_block <= tip {
        backfill(&indexer, http_client, from_block, tip).await?;
        *last_processed_block = tip;
    }

    let ws_url = config
        .ws_url
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    let (ws_stream, _) = connect_async(&ws_url).await.context("WS connect")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // One subscription over every tracked topic; items are told apart by
    // topic0 (and, for creations, the factory address).
    let mut topics: Vec<String> = vec![topic_hex(indexer.table.created_topic())];
    topics.extend(indexer.table.game_topics().iter().map(topic_hex));
    let sub_req = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "eth_subscribe",
        "params": ["logs", { "topics": [topics] }]
    });
    ws_sender
        .send(Message::Text(serde_json::to_string(&sub_req)?))
        .await
        .map_err(|e| anyhow::anyhow!("send subscribe: {}", e))?;

    match timeout(Duration::from_secs(10), ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            let v: Value = serde_json::from_str(&text).context("parse sub response")?;
            if v.get("error").is_some() {
                let err = v["error"].get("message").and_then(|m| m.as_str()).unwrap_or("");
                if err.contains("data did not match") || err.contains("variant") {
                    tracing::warn!("RPC does not support logs filter, using client-side filter");
                    let sub_req_no_filter = json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "method": "eth_subscribe",
                        "params": ["logs"]
                    });
                    ws_sender
                        .send(Message::Text(serde_json::to_string(&sub_req_no_filter)?))
                        .await
                        .map_err(|e| anyhow::anyhow!("send subscribe: {}", e))?;
                    let text2 = timeout(Duration::from_secs(10), ws_receiver.next())
                        .await
                        .map_err(|_| anyhow::anyhow!("subscribe timeout"))?
                        .ok_or_else(|| anyhow::anyhow!("ws closed"))?
                        .map_err(|e| anyhow::anyhow!("ws: {}", e))?;
                    let msg = match text2 {
                        Message::Text(t) => t,
                        _ => anyhow::bail!("expected text"),
                    };
                    let v2: Value = serde_json::from_str(&msg)?;
                    v2["result"]
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("no sub id"))?;
                } else {
                    anyhow::bail!("subscribe error: {}", err);
                }
            } else {
                v["result"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("no result"))?;
            }
        }
        Ok(Some(Ok(_))) => anyhow::bail!("unexpected message"),
        Ok(Some(Err(e))) => return Err(anyhow::anyhow!("ws: {}", e)),
        Ok(None) => anyhow::bail!("ws closed"),
        Err(_) => anyhow::bail!("subscribe timeout"),
    }

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg.map_err(|e| anyhow::anyhow!("ws: {}", e))? {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let v: Value = serde_json::from_str(&text).context("parse ws message")?;
        if v.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
            continue;
        }
        let result = v
            .get("params")
            .and_then(|p| p.get("result"))
            .ok_or_else(|| anyhow::anyhow!("no params.result"))?;
        // decode_item is also the client-side filter for unfiltered nodes.
        if let Some(item) = indexer.decode_item(result) {
            let block = match &item {
                IndexedItem::Creation(c) => c.block_number,
                IndexedItem::Game(g) => g.block_number,
            };
            *last_processed_block = (*last_processed_block).max(block);
            let _ = indexer.event_tx.send(item);
        }
    }
    Ok(())
}

async fn backfill(
    indexer: &GameIndexer,
    client: &reqwest::Client,
    from_block: u64,
    to_block: u64,
) -> Result<()> {
    let config = &indexer.config;
    let mut from = from_block;
    while from <= to_block {
        let to = (from + config.getlogs_max_range - 1).min(to_block);
        let creation_filter =
            build_creation_filter(config, &indexer.table, Some(from), Some(to));
        let game_filter = build_game_filter(&indexer.table, Some(from), Some(to));
        let mut logs = eth_get_logs(client, &config.http_url, creation_filter).await?;
        logs.extend(eth_get_logs(client, &config.http_url, game_filter).await?);
        let mut items: Vec<(u64, u64, IndexedItem)> = logs
            .iter()
            .filter_map(|log| {
                let item = indexer.decode_item(log)?;
                let (block, log_index) = match &item {
                    IndexedItem::Creation(c) => (c.block_number, 0),
                    IndexedItem::Game(g) => (g.block_number, g.log_index),
                };
                Some((block, log_index, item))
            })
            .collect();
        if !logs.is_empty() && items.is_empty() {
            tracing::warn!(raw_count = logs.len(), from, to, "backfill: logs received but none decoded");
        } else if !items.is_empty() {
            tracing::debug!(count = items.len(), from, to, "backfill: decoded items");
        }
        items.sort_by_key(|(block, log_index, _)| (*block, *log_index));
        for (_, _, item) in items {
            let _ = indexer.event_tx.send(item);
        }
        from = to + 1;
    }
    Ok(())
}
