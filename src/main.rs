//! market_replay_sim - Deterministic Multi-Tenant Market Replay Simulator
//!
//! Standalone demo entry point: loads the simulator config, replays a
//! small synthetic AAPL tape through one session, and prints an
//! execution + performance summary.
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│ Session  │───▶│ Matching │───▶│ Summary  │
//! │  (YAML)  │    │ Manager  │    │ + Ledger │    │ (stdout) │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use market_replay_sim::config::SimulatorConfig;
use market_replay_sim::data_source::{InMemoryDataSource, SourceEvent};
use market_replay_sim::logging::init_logging;
use market_replay_sim::messages::{QuoteData, TradeData};
use market_replay_sim::models::{Order, OrderStatus, OrderType, Side, TimeInForce};
use market_replay_sim::session_manager::{NewSessionRequest, SessionManager};

const SYMBOL: &str = "AAPL";

fn get_output_dir() -> &'static str {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--baseline") {
        "baseline"
    } else {
        "output"
    }
}

/// A deterministic synthetic tape: an opening quote, a slow price
/// decline over the session, and a trade print on every other tick.
fn build_demo_tape() -> Vec<SourceEvent> {
    let mut events = Vec::new();
    let mut price = 100.0;
    for i in 0..200i64 {
        let ts = i * 1_000_000_000;
        price -= 0.01;
        events.push(SourceEvent::Quote {
            symbol: SYMBOL.to_string(),
            timestamp_ns: ts,
            data: QuoteData {
                bid: price - 0.02,
                bid_size: 500.0,
                ask: price + 0.02,
                ask_size: 500.0,
            },
        });
        if i % 2 == 0 {
            events.push(SourceEvent::Trade {
                symbol: SYMBOL.to_string(),
                timestamp_ns: ts + 1,
                data: TradeData { price, size: 100.0 },
            });
        }
    }
    events
}

fn demo_order(id: u64, side: Side, order_type: OrderType, tif: TimeInForce, qty: f64) -> Order {
    Order {
        id,
        client_order_id: format!("demo-{id}"),
        symbol: SYMBOL.to_string(),
        side,
        order_type,
        tif,
        qty,
        filled_qty: 0.0,
        limit_price: None,
        stop_price: None,
        trail_price: None,
        trail_percent: None,
        hwm: None,
        stop_triggered: false,
        is_maker: false,
        extended_hours: false,
        min_exec_ns: 0,
        status: OrderStatus::New,
        rejection_reason: None,
        last_fill_price: 0.0,
        created_at_ns: 0,
        submitted_at_ns: 0,
        updated_at_ns: 0,
        filled_at_ns: None,
        canceled_at_ns: None,
        expired_at_ns: None,
        expire_at: None,
    }
}

fn main() -> anyhow::Result<()> {
    let output_dir = get_output_dir();
    println!("=== market_replay_sim: demo replay ({}) ===", env!("GIT_HASH"));
    println!("Output directory: {output_dir}/\n");

    let start_time = Instant::now();

    println!("[1] Loading configuration...");
    let config = SimulatorConfig::load("config/simulator.yaml").unwrap_or_default();
    let _log_guard = init_logging(&config.logging);

    std::fs::create_dir_all(output_dir)?;
    let summary_path = format!("{output_dir}/summary.txt");

    println!("\n[2] Building synthetic tape for {SYMBOL}...");
    let tape = build_demo_tape();
    println!("    {} events generated", tape.len());

    println!("\n[3] Starting session manager...");
    let source = Arc::new(InMemoryDataSource::new(tape));
    let manager = SessionManager::new(config, source);

    let session_id = manager
        .create_session(NewSessionRequest {
            session_id: Some("demo".to_string()),
            symbols: vec![SYMBOL.to_string()],
            start_time: 0,
            end_time: 200 * 1_000_000_000,
            initial_capital: Some(100_000.0),
            speed_factor: Some(0.0),
        })
        .map_err(|e| anyhow::anyhow!("session creation should succeed with a fresh id: {e}"))?;

    println!("\n[4] Submitting a resting limit buy...");
    manager
        .submit_order(
            &session_id,
            demo_order(1, Side::Buy, OrderType::Limit, TimeInForce::Day, 100.0),
        )
        .ok();

    println!("\n[5] Running session to completion...");
    let exec_start = Instant::now();
    manager.start_session(&session_id)?;
    // The session's own worker thread paces event delivery; at
    // speed_factor == 0.0 it drains the preloaded tape immediately, so a
    // short join loop is enough for this single-shot demo.
    while manager.status(&session_id)? == market_replay_sim::SessionStatus::Running {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let exec_time = exec_start.elapsed();

    println!("\n[6] Collecting results...");
    let account = manager.account_state(&session_id)?;
    let positions = manager.positions(&session_id)?;
    let (total_return, max_drawdown, sharpe) = manager.performance_summary(&session_id)?;
    let orders = manager.list_orders(&session_id)?;

    let summary = format!(
        "=== Execution Summary ===\n\
         Symbol: {SYMBOL}\n\
         Orders submitted: {}\n\
         Exec time: {:.2?}\n\n\
         Account: cash={:.2} equity={:.2} buying_power={:.2}\n\
         Positions: {}\n\n\
         Performance: total_return={:.4} max_drawdown={:.4} sharpe={:.4}\n",
        orders.len(),
        exec_time,
        account.cash,
        account.equity,
        account.buying_power,
        positions.len(),
        total_return,
        max_drawdown,
        sharpe,
    );

    println!("\n{summary}");
    let mut summary_file = File::create(&summary_path)?;
    summary_file.write_all(summary.as_bytes())?;
    println!("Summary written to {summary_path}");

    manager.shutdown();
    println!("\nTotal time: {:.2?}", start_time.elapsed());
    println!("=== Done ===");
    Ok(())
}
