// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Order engine --------
pub static ORDERS_ACCEPTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_accepted_total", "accepted orders (labels: action, mode)"),
        &["action", "mode"],
    )
    .unwrap()
});

pub static ORDERS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_rejected_total", "rejected orders (label: reason)"),
        &["reason"],
    )
    .unwrap()
});

pub static LEDGER_APPENDS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ledger_appends_total", "action records appended").unwrap());

// -------- Chain engine --------
pub static CHAIN_TX: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("chain_tx_total", "token transfers (labels: network, status)"),
        &["network", "status"],
    )
    .unwrap()
});

pub static GAS_CACHE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("gas_cache_total", "gas snapshot lookups (label: result = hit|miss)"),
        &["result"],
    )
    .unwrap()
});

pub static GAS_FETCH_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("gas_fetch_retries_total", "gas pricing fetch attempts beyond the first")
        .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_TRADE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_trade_mode", "trade mode (label: mode)"), &["mode"])
        .unwrap()
});

pub static CONFIG_NETWORK: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_chain_network", "configured chain network (label: network)"),
        &["network"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(ORDERS_ACCEPTED.clone())),
        REGISTRY.register(Box::new(ORDERS_REJECTED.clone())),
        REGISTRY.register(Box::new(LEDGER_APPENDS.clone())),
        REGISTRY.register(Box::new(CHAIN_TX.clone())),
        REGISTRY.register(Box::new(GAS_CACHE.clone())),
        REGISTRY.register(Box::new(GAS_FETCH_RETRIES.clone())),
        REGISTRY.register(Box::new(CONFIG_TRADE_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_NETWORK.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("metrics bind {} failed: {}", addr, e);
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
