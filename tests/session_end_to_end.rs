//! End-to-end tests driving a session purely through `SessionManager`'s
//! public API: submit orders, replay a tape, inspect the resulting
//! account and order state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use market_replay_sim::config::SimulatorConfig;
use market_replay_sim::data_source::{InMemoryDataSource, SourceEvent};
use market_replay_sim::messages::{QuoteData, TradeData};
use market_replay_sim::models::{Order, OrderStatus, OrderType, Side, TimeInForce};
use market_replay_sim::session_manager::{NewSessionRequest, SessionManager};
use market_replay_sim::SessionStatus;

fn demo_order(side: Side, order_type: OrderType, qty: f64, limit_price: Option<f64>) -> Order {
    Order {
        id: 0,
        client_order_id: "t".to_string(),
        symbol: "AAPL".to_string(),
        side,
        order_type,
        tif: TimeInForce::Day,
        qty,
        filled_qty: 0.0,
        limit_price,
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

fn manager_with_tape(tmp: &std::path::Path, tape: Vec<SourceEvent>) -> SessionManager {
    let mut config = SimulatorConfig::default();
    config.execution.wal_directory = tmp.to_string_lossy().to_string();
    config.execution.enable_margin_call_checks = false;
    SessionManager::new(config, Arc::new(InMemoryDataSource::new(tape)))
}

fn wait_for_completion(manager: &SessionManager, id: &str) {
    for _ in 0..200 {
        if manager.status(id).unwrap() != SessionStatus::Running {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("session {id} never left Running status");
}

#[test]
fn resting_limit_buy_fills_on_crossing_quote() {
    let dir = tempfile::tempdir().unwrap();
    let tape = vec![
        SourceEvent::Quote {
            symbol: "AAPL".to_string(),
            timestamp_ns: 1_000_000_000,
            data: QuoteData { bid: 99.0, bid_size: 100.0, ask: 100.0, ask_size: 100.0 },
        },
        // Ask drops to meet the resting limit buy at 99.5.
        SourceEvent::Quote {
            symbol: "AAPL".to_string(),
            timestamp_ns: 2_000_000_000,
            data: QuoteData { bid: 99.0, bid_size: 100.0, ask: 99.5, ask_size: 100.0 },
        },
    ];
    let manager = manager_with_tape(dir.path(), tape);
    let id = manager
        .create_session(NewSessionRequest {
            session_id: Some("s1".to_string()),
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 3_000_000_000,
            initial_capital: Some(100_000.0),
            speed_factor: Some(0.0),
        })
        .unwrap();

    let order_id = manager
        .submit_order(&id, demo_order(Side::Buy, OrderType::Limit, 10.0, Some(99.5)))
        .unwrap();

    manager.start_session(&id).unwrap();
    wait_for_completion(&manager, &id);

    let order = manager.get_order(&id, order_id).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_qty, 10.0);

    let account = manager.account_state(&id).unwrap();
    assert!(account.cash < 100_000.0, "cash should be debited by the fill");
    // A single 10-share fill must only be counted once: the old
    // double-counting bug would have shown filled_qty == 20.0 here.
    assert_eq!(order.filled_qty, 10.0);
}

#[test]
fn ioc_order_with_no_liquidity_cancels_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_with_tape(dir.path(), Vec::new());
    let id = manager
        .create_session(NewSessionRequest {
            session_id: Some("s2".to_string()),
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 1_000_000_000,
            initial_capital: Some(100_000.0),
            speed_factor: Some(0.0),
        })
        .unwrap();

    let mut order = demo_order(Side::Buy, OrderType::Limit, 5.0, Some(100.0));
    order.tif = TimeInForce::Ioc;
    let order_id = manager.submit_order(&id, order).unwrap();

    let got = manager.get_order(&id, order_id).unwrap().unwrap();
    assert_eq!(got.status, OrderStatus::Canceled);
}

#[test]
fn callback_fan_out_sees_order_accepted_and_filled() {
    let dir = tempfile::tempdir().unwrap();
    let tape = vec![SourceEvent::Quote {
        symbol: "AAPL".to_string(),
        timestamp_ns: 1_000_000_000,
        data: QuoteData { bid: 99.0, bid_size: 100.0, ask: 99.5, ask_size: 100.0 },
    }];
    let manager = manager_with_tape(dir.path(), tape);
    let id = manager
        .create_session(NewSessionRequest {
            session_id: Some("s3".to_string()),
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 2_000_000_000,
            initial_capital: Some(100_000.0),
            speed_factor: Some(0.0),
        })
        .unwrap();

    let fills_seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fills_seen);
    manager
        .add_event_callback(
            &id,
            Arc::new(move |_session_id, event| {
                if matches!(event, market_replay_sim::SessionEvent::OrderFilled { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

    manager
        .submit_order(&id, demo_order(Side::Buy, OrderType::Market, 1.0, None))
        .unwrap();

    manager.start_session(&id).unwrap();
    wait_for_completion(&manager, &id);

    assert_eq!(fills_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn trade_only_tape_completes_without_any_orders() {
    let dir = tempfile::tempdir().unwrap();
    let tape = vec![SourceEvent::Trade {
        symbol: "AAPL".to_string(),
        timestamp_ns: 500_000_000,
        data: TradeData { price: 50.0, size: 10.0 },
    }];
    let manager = manager_with_tape(dir.path(), tape);
    let id = manager
        .create_session(NewSessionRequest {
            session_id: Some("s4".to_string()),
            symbols: vec!["AAPL".to_string()],
            start_time: 0,
            end_time: 1_000_000_000,
            initial_capital: Some(50_000.0),
            speed_factor: Some(0.0),
        })
        .unwrap();
    manager.start_session(&id).unwrap();
    wait_for_completion(&manager, &id);
    assert_eq!(manager.status(&id).unwrap(), SessionStatus::Completed);
}
