//! Example: run GameIndexer and print each decoded creation and game event.
//!
//! Usage: cargo run -p rps --example rps_indexer -- --http-url URL --ws-url WS_URL --factory 0x...

use rps::{EngineConfig, GameIndexer, IndexedItem};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let mut http_url = String::new();
    let mut ws_url = String::new();
    let mut factory = String::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--http-url" => {
                i += 1;
                http_url = args.get(i).cloned().unwrap_or_default();
            }
            "--ws-url" => {
                i += 1;
                ws_url = args.get(i).cloned().unwrap_or_default();
            }
            "--factory" => {
                i += 1;
                factory = args.get(i).cloned().unwrap_or_default();
            }
            _ => {}
        }
        i += 1;
    }
    if http_url.is_empty() || ws_url.is_empty() || factory.is_empty() {
        eprintln!("Usage: rps_indexer --http-url URL --ws-url WS_URL --factory 0xADDR");
        std::process::exit(1);
    }
    let addr_hex = factory.strip_prefix("0x").unwrap_or(&factory);
    let addr_bytes = hex::decode(addr_hex)?;
    if addr_bytes.len() != 20 {
        eprintln!("factory must be 20 bytes");
        std::process::exit(1);
    }
    let mut factory_address = [0u8; 20];
    factory_address.copy_from_slice(&addr_bytes);

    let config = EngineConfig {
        ws_url,
        http_url: http_url.clone(),
        factory_address,
        creation_block: 0,
        confirmations: 2,
        timeout_in_blocks: 20,
        getlogs_max_range: 1000,
        reconnection: Default::default(),
    };
    let indexer = Arc::new(GameIndexer::new(config));
    let mut recv = indexer.subscribe();
    let indexer_clone = Arc::clone(&indexer);
    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let _ = indexer_clone.run().await;
        });
    });
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        loop {
            tokio::select! {
                Ok(item) = recv.recv() => {
                    match item {
                        IndexedItem::Creation(c) => {
                            println!(
                                "Created contract=0x{} player0=0x{} block={} wager={} escrow={} timeout={}",
                                hex::encode(c.contract),
                                hex::encode(c.player0),
                                c.block_number,
                                c.wager,
                                c.escrow,
                                c.timeout_in_blocks
                            );
                        }
                        IndexedItem::Game(g) => {
                            println!(
                                "Game contract=0x{} block={} log_index={} event={:?}",
                                hex::encode(g.contract),
                                g.block_number,
                                g.log_index,
                                g.event
                            );
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(3600)) => break,
            }
        }
    });
    Ok(())
}
