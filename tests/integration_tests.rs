#[cfg(test)]
mod tests {
    use polyarb::catalog::{CatalogClient, Market, VenueTag};
    use polyarb::position_store::{Position, PositionLeg, PositionStatus, PositionStore};
    use polyarb::strategy::{
        penny_defense_handler, CalendarArbitrageStrategy, ExtremePriceStrategy, Opportunity,
        Strategy, StrategyContext, StrategyStats,
    };
    use polyarb::strategy::calendar::CalendarParams;
    use polyarb::strategy::extreme_price::ExtremePriceParams;
    use polyarb::streamer::{MarketStreamer, PriceUpdate, StreamerConfig};
    use polyarb::utils::{Config, Credentials};
    use polyarb::venue::{StubVenue, VenueClient};
    use polyarb::{OrderExecutor, Side};

    use chrono::Utc;
    use futures::StreamExt;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::protocol::Message;

    const NO_EARLY: &str = "noearl-token-a";
    const YES_EARLY: &str = "yesear-token-a";
    const YES_LATE: &str = "yeslat-token-b";
    const NO_LATE: &str = "nolate-token-b";

    fn test_ctx(stub: Arc<StubVenue>, dir: &tempfile::TempDir) -> StrategyContext {
        let config = Arc::new(Config::default());
        let store = Arc::new(
            PositionStore::open(dir.path().join("positions_test.json")).unwrap(),
        );

        StrategyContext {
            config: config.clone(),
            credentials: Arc::new(Credentials::default()),
            venue: stub as Arc<dyn VenueClient>,
            cross_venue: None,
            catalog: Arc::new(CatalogClient::new(
                "http://127.0.0.1:1",
                Duration::from_secs(1),
            )),
            executor: Arc::new(OrderExecutor::new(false)),
            store,
            matcher: None,
            dry_run: false,
            estimated_fee: dec!(0.01),
            stats: Arc::new(StrategyStats::default()),
        }
    }

    fn market(question: &str, end_date: &str, yes: &str, no: &str) -> Market {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{yes}-{no}",
                "question": "{question}",
                "endDate": "{end_date}",
                "clobTokenIds": "[\"{yes}\", \"{no}\"]",
                "outcomes": "[\"Yes\", \"No\"]",
                "active": true,
                "closed": false
            }}"#
        ))
        .unwrap()
    }

    fn calendar_pair() -> (Market, Market) {
        let early = market(
            "Will Bitcoin hit $100k by September 2026?",
            "2026-09-30T00:00:00Z",
            YES_EARLY,
            NO_EARLY,
        );
        let late = market(
            "Will Bitcoin hit $100k by December 2026?",
            "2026-12-31T00:00:00Z",
            YES_LATE,
            NO_LATE,
        );
        (early, late)
    }

    fn calendar_strategy() -> CalendarArbitrageStrategy {
        CalendarArbitrageStrategy::new(CalendarParams {
            min_annualized_roi: dec!(0.05),
            ..CalendarParams::default()
        })
    }

    fn seed_calendar_books(stub: &StubVenue) {
        // Ask(NO_early)=0.40 and Ask(YES_late)=0.55, both depth 10; bids
        // behind for rollback and exit paths.
        stub.set_book(NO_EARLY, &[(dec!(0.39), dec!(50))], &[(dec!(0.40), dec!(10))]);
        stub.set_book(YES_LATE, &[(dec!(0.54), dec!(50))], &[(dec!(0.55), dec!(10))]);
    }

    // Two markets on the same event at different expiries priced so that
    // NO_early + YES_late = 0.95: one opportunity, entered atomically.
    #[tokio::test]
    async fn calendar_arbitrage_profitable_pair_is_entered() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        seed_calendar_books(&stub);
        let ctx = test_ctx(stub.clone(), &dir);

        let strategy = calendar_strategy();
        let (early, late) = calendar_pair();

        let opp = strategy
            .evaluate_pair(&ctx, &early, &late)
            .await
            .expect("pair should clear the profit gate");

        assert_eq!(opp.total_cost, dec!(0.95));
        // expected_profit = 1 - total_cost - 2×fee
        assert_eq!(opp.expected_profit, dec!(0.03));
        assert_eq!(opp.legs.len(), 2);
        assert_eq!(opp.legs[0].token_id, NO_EARLY);
        assert_eq!(opp.legs[1].token_id, YES_LATE);

        assert!(strategy.should_enter(&ctx, &opp).await.unwrap());
        assert!(strategy.enter_position(&ctx, &opp).await.unwrap());

        // Both BUY orders placed concurrently against the venue.
        assert_eq!(stub.order_count(), 2);
        assert!(stub
            .orders_for(NO_EARLY)
            .iter()
            .all(|o| o.side == Side::Buy));

        // Position stored under both tokens with the calendar group id.
        let position = ctx.store.get(NO_EARLY).expect("position persisted");
        assert_eq!(position.group_id, "CAL-noearl-yeslat");
        assert_eq!(position.status, PositionStatus::Open);
        assert!(ctx.store.has(YES_LATE));

        // Accepted pair honors the acceptance bound:
        // Σ entry ≤ 1 − min_profit_threshold − 2×fee.
        assert!(position.entry_cost_per_unit() <= dec!(0.96));
        assert_eq!(ctx.stats.entered.load(Ordering::Relaxed), 1);
    }

    // Second leg rejected: the filled first leg is sold back and no
    // position is stored.
    #[tokio::test]
    async fn calendar_second_leg_failure_rolls_back_first() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        seed_calendar_books(&stub);
        stub.reject_orders_for(YES_LATE);
        let ctx = test_ctx(stub.clone(), &dir);

        let strategy = calendar_strategy();
        let (early, late) = calendar_pair();
        let opp = strategy.evaluate_pair(&ctx, &early, &late).await.unwrap();

        assert!(!strategy.enter_position(&ctx, &opp).await.unwrap());

        // BUY then compensating SELL on the early leg, at its best bid.
        let orders = stub.orders_for(NO_EARLY);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[1].side, Side::Sell);
        assert_eq!(orders[1].price, dec!(0.39));

        assert!(!ctx.store.has(NO_EARLY));
        assert!(!ctx.store.has(YES_LATE));
        assert_eq!(ctx.stats.entered.load(Ordering::Relaxed), 0);
    }

    // Rollback itself fails: a Failed position is recorded for operator
    // attention and the engine keeps going.
    #[tokio::test]
    async fn failed_rollback_records_position_for_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        seed_calendar_books(&stub);
        stub.reject_orders_for(YES_LATE);
        stub.reject_sells_for(NO_EARLY);
        let ctx = test_ctx(stub.clone(), &dir);

        let strategy = calendar_strategy();
        let (early, late) = calendar_pair();
        let opp = strategy.evaluate_pair(&ctx, &early, &late).await.unwrap();

        assert!(!strategy.enter_position(&ctx, &opp).await.unwrap());

        let orphan = ctx.store.get(NO_EARLY).expect("orphan recorded");
        assert_eq!(orphan.status, PositionStatus::Failed);
        assert_eq!(orphan.legs.len(), 1);
        assert_eq!(orphan.legs[0].entry_price, dec!(0.40));
    }

    // Invalidity risk blocks the pair even when the prices are right.
    #[tokio::test]
    async fn invalid_market_risk_rejects_pair() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        seed_calendar_books(&stub);
        let ctx = test_ctx(stub.clone(), &dir);

        let strategy = calendar_strategy();
        let (mut early, late) = calendar_pair();
        early.description = Some("Resolves INVALID if the event is postponed".to_string());

        assert!(strategy.evaluate_pair(&ctx, &early, &late).await.is_none());
    }

    // Calendar early exit: take-profit once the bids add up past entry
    // plus fees plus margin; stop-loss when the spread reverses.
    #[tokio::test]
    async fn calendar_exit_policy() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        let ctx = test_ctx(stub.clone(), &dir);
        let strategy = calendar_strategy();

        let position = Position {
            group_id: "CAL-noearl-yeslat".to_string(),
            strategy_name: strategy.name().to_string(),
            question: "Will Bitcoin hit $100k?".to_string(),
            legs: vec![
                PositionLeg {
                    token_id: NO_EARLY.to_string(),
                    side: Side::Buy,
                    entry_price: dec!(0.40),
                    size: dec!(10),
                    venue: VenueTag::Primary,
                },
                PositionLeg {
                    token_id: YES_LATE.to_string(),
                    side: Side::Buy,
                    entry_price: dec!(0.55),
                    size: dec!(10),
                    venue: VenueTag::Primary,
                },
            ],
            entry_time: Utc::now(),
            target_price: None,
            status: PositionStatus::Open,
            force_exit: false,
        };

        // Hold: bids sum to 0.955, below 0.95 + 0.02 + 0.005.
        stub.set_book(NO_EARLY, &[(dec!(0.40), dec!(50))], &[]);
        stub.set_book(YES_LATE, &[(dec!(0.555), dec!(50))], &[]);
        assert!(!strategy.should_exit(&ctx, &position).await.unwrap());

        // Take profit: bids sum to 0.98 ≥ 0.975.
        stub.set_book(NO_EARLY, &[(dec!(0.42), dec!(50))], &[]);
        stub.set_book(YES_LATE, &[(dec!(0.56), dec!(50))], &[]);
        assert!(strategy.should_exit(&ctx, &position).await.unwrap());

        // Stop loss: bids sum to 0.92, loss 0.03 > 0.02 tolerance.
        stub.set_book(NO_EARLY, &[(dec!(0.38), dec!(50))], &[]);
        stub.set_book(YES_LATE, &[(dec!(0.54), dec!(50))], &[]);
        assert!(strategy.should_exit(&ctx, &position).await.unwrap());
    }

    // Penny defense: a streamer tick through the entry price flags the
    // position, and the next monitor pass exits and clears the store.
    #[tokio::test]
    async fn penny_defense_flags_and_exit_clears_position() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        let ctx = test_ctx(stub.clone(), &dir);

        let token = "pd-token";
        let fingerprint = Opportunity::fingerprint_for(&[token]);
        ctx.store
            .add(Position {
                group_id: fingerprint,
                strategy_name: "ExtremePriceStrategy".to_string(),
                question: "Penny defense scenario".to_string(),
                legs: vec![PositionLeg {
                    token_id: token.to_string(),
                    side: Side::Buy,
                    entry_price: dec!(0.05),
                    size: dec!(100),
                    venue: VenueTag::Primary,
                }],
                entry_time: Utc::now(),
                target_price: Some(dec!(0.10)),
                status: PositionStatus::Open,
                force_exit: false,
            })
            .unwrap();

        // Inbound update shows best_bid above entry.
        let handler = penny_defense_handler(ctx.store.clone());
        handler(
            token.to_string(),
            PriceUpdate {
                best_bid: Some(dec!(0.06)),
                best_ask: None,
            },
        )
        .await;

        assert!(ctx.store.get(token).unwrap().force_exit);

        // The monitor loop reacts by exiting; the sell clears the store.
        stub.set_book(token, &[(dec!(0.06), dec!(500))], &[]);
        let strategy = ExtremePriceStrategy::new(ExtremePriceParams::default());
        let position = ctx.store.get(token).unwrap();
        assert!(strategy.exit_position(&ctx, &position).await.unwrap());
        assert!(!ctx.store.has(token));
        assert_eq!(ctx.stats.exited.load(Ordering::Relaxed), 1);

        let sells = stub.orders_for(token);
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].side, Side::Sell);
        assert_eq!(sells[0].price, dec!(0.06));
    }

    // Extreme-price exit trigger: sell once the bid reaches entry ×
    // multiplier.
    #[tokio::test]
    async fn extreme_price_exits_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        let ctx = test_ctx(stub.clone(), &dir);
        let strategy = ExtremePriceStrategy::new(ExtremePriceParams::default());

        let token = "xp-token";
        let position = Position {
            group_id: Opportunity::fingerprint_for(&[token]),
            strategy_name: strategy.name().to_string(),
            question: "Extreme price scenario".to_string(),
            legs: vec![PositionLeg {
                token_id: token.to_string(),
                side: Side::Buy,
                entry_price: dec!(0.004),
                size: dec!(1250),
                venue: VenueTag::Primary,
            }],
            entry_time: Utc::now(),
            target_price: Some(dec!(0.008)),
            status: PositionStatus::Open,
            force_exit: false,
        };

        stub.set_book(token, &[(dec!(0.0079), dec!(5000))], &[]);
        assert!(!strategy.should_exit(&ctx, &position).await.unwrap());

        stub.set_book(token, &[(dec!(0.008), dec!(5000))], &[]);
        assert!(strategy.should_exit(&ctx, &position).await.unwrap());
    }

    // Streamer reconnect: the full subscription set is re-issued on the
    // new connection without being re-registered.
    #[tokio::test]
    async fn streamer_reconnect_preserves_subscriptions() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (counts_tx, mut counts_rx) = tokio::sync::mpsc::unbounded_channel::<usize>();

        // Fake venue feed: accept, read the subscription, drop the first
        // connection to force a reconnect, hold the second briefly.
        tokio::spawn(async move {
            for attempt in 0..2 {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                // Skip ping/pong frames; the subscription is the first
                // text frame.
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        let payload: serde_json::Value = serde_json::from_str(&text).unwrap();
                        let count =
                            payload["assets_ids"].as_array().map(|a| a.len()).unwrap_or(0);
                        let _ = counts_tx.send(count);
                        break;
                    }
                }
                if attempt == 0 {
                    let _ = ws.close(None).await;
                } else {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        });

        let streamer = Arc::new(MarketStreamer::new(StreamerConfig {
            wss_url: format!("ws://{}", addr),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            max_silence: Duration::from_secs(60),
            max_reconnect_delay: Duration::from_secs(2),
        }));

        let tokens: Vec<String> = (1..=100).map(|i| format!("T{}", i)).collect();
        streamer.subscribe_batch(&tokens, 100).await;
        let before = streamer.subscribed_tokens();

        let runner = streamer.clone();
        let run_handle = tokio::spawn(async move { runner.run().await });

        let first = tokio::time::timeout(Duration::from_secs(10), counts_rx.recv())
            .await
            .expect("first subscription")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(10), counts_rx.recv())
            .await
            .expect("re-subscription after reconnect")
            .unwrap();

        assert_eq!(first, 100);
        assert_eq!(second, 100);
        assert_eq!(streamer.subscribed_tokens(), before);

        streamer.stop();
        let _ = tokio::time::timeout(Duration::from_secs(5), run_handle).await;
    }

    // Fingerprints are stable across scans and order-sensitive in the
    // token list.
    #[test]
    fn opportunity_fingerprints_are_stable() {
        let a = Opportunity::fingerprint_for(&["tok1", "tok2"]);
        let b = Opportunity::fingerprint_for(&["tok1", "tok2"]);
        let c = Opportunity::fingerprint_for(&["tok2", "tok1"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    // Catalog filtering feeds the extreme-price scan: markets below the
    // buy threshold surface with the right outcome index.
    #[test]
    fn extreme_price_hits_surface_cheap_outcomes() {
        let mut cheap = market(
            "Longshot outcome?",
            "2026-12-31T00:00:00Z",
            "cheap-yes",
            "cheap-no",
        );
        cheap.outcome_prices = vec![dec!(0.004), dec!(0.996)];
        let mut normal = market(
            "Coin flip?",
            "2026-12-31T00:00:00Z",
            "fair-yes",
            "fair-no",
        );
        normal.outcome_prices = vec![dec!(0.50), dec!(0.50)];

        let hits = CatalogClient::find_extreme_prices(&[cheap, normal], dec!(0.004), dec!(0.99));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].outcome_index, 0);
        assert_eq!(hits[0].price, dec!(0.004));
    }

    // Position sizing from the S4 scenario: $1000 balance, 0.5% per
    // trade, price 0.004 → 1250 units.
    #[test]
    fn extreme_price_position_sizing() {
        let size =
            polyarb::utils::calculate_position_size(dec!(1000), dec!(0.005), dec!(0.004), dec!(5));
        assert_eq!(size, dec!(1250));
    }

    // Store durability invariant: what was saved is what loads, and a
    // corrupt file yields an empty store plus a renamed backup.
    #[test]
    fn position_store_roundtrip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions_abc123.json");

        {
            let store = PositionStore::open(path.clone()).unwrap();
            store
                .add(Position {
                    group_id: "G1".to_string(),
                    strategy_name: "S".to_string(),
                    question: "Q".to_string(),
                    legs: vec![PositionLeg {
                        token_id: "t1".to_string(),
                        side: Side::Buy,
                        entry_price: dec!(0.10),
                        size: dec!(10),
                        venue: VenueTag::Primary,
                    }],
                    entry_time: Utc::now(),
                    target_price: None,
                    status: PositionStatus::Open,
                    force_exit: false,
                })
                .unwrap();
        }

        let store = PositionStore::open(path.clone()).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.get("t1").unwrap().legs[0].entry_price, dec!(0.10));

        std::fs::write(&path, "{{{{ definitely not json").unwrap();
        let store = PositionStore::open(path).unwrap();
        assert_eq!(store.count(), 0);
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt_"))
            .count();
        assert_eq!(backups, 1);
    }

    // Dry-run executor: fills at the observed limit price without any
    // venue order.
    #[tokio::test]
    async fn dry_run_simulates_fills_without_orders() {
        let stub = Arc::new(StubVenue::with_balance(dec!(1000)));
        let venue = stub.clone() as Arc<dyn VenueClient>;
        let executor = OrderExecutor::new(true);

        let report = executor
            .execute(
                &venue,
                "dry-token",
                Side::Buy,
                dec!(10),
                dec!(0.40),
                polyarb::venue::OrderType::Gtc,
            )
            .await;

        assert!(report.success);
        assert_eq!(report.avg_fill_price, dec!(0.40));
        assert_eq!(stub.order_count(), 0);
    }

    // Balance must cover the entry; an underfunded wallet rejects it.
    #[tokio::test]
    async fn should_enter_rejects_when_balance_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubVenue::with_balance(dec!(1)));
        seed_calendar_books(&stub);
        let ctx = test_ctx(stub.clone(), &dir);

        let strategy = calendar_strategy();
        let (early, late) = calendar_pair();
        let opp = strategy.evaluate_pair(&ctx, &early, &late).await.unwrap();

        // 10 contracts × $0.95 ≫ $1 balance.
        assert!(!strategy.should_enter(&ctx, &opp).await.unwrap());
    }
}
