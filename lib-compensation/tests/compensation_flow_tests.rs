//! End-to-end tests: registration, investment events, matching runs and
//! wallet reconciliation wired together through `CompensationSystem`.

use async_trait::async_trait;
use lib_compensation::lease::{self, LeaseAcquisition};
use lib_compensation::types::apply_bps;
use lib_compensation::wallet::{CreditReceipt, CreditRequest};
use lib_compensation::{
    CompensationConfig, CompensationStore, CompensationSystem, DeferredWallet, InMemoryWallet, InvestmentEvent,
    ManualClock, MemoryStore, Placement, Reconciler, Registration, Side, SledStore, TriggerOutcome, UserId,
    WalletError, WalletService,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const NOON: u64 = 1_704_196_800; // 2024-01-02 12:00:00 UTC

struct Harness {
    system: CompensationSystem,
    store: MemoryStore,
    wallet: InMemoryWallet,
    clock: Arc<ManualClock>,
}

fn harness_with(config: CompensationConfig, store: MemoryStore, holder: &str) -> Harness {
    let wallet = InMemoryWallet::new();
    let clock = Arc::new(ManualClock::new(NOON));
    let system = CompensationSystem::new(
        &config,
        Arc::new(store.clone()),
        Arc::new(wallet.clone()),
        clock.clone(),
        holder,
    )
    .unwrap();
    Harness {
        system,
        store,
        wallet,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(CompensationConfig::for_testing(), MemoryStore::new(), "node-a")
}

fn direct(user: &str, sponsor: &str, parent: &str, side: Side) -> Registration {
    Registration {
        user_id: user.into(),
        sponsor_id: Some(sponsor.into()),
        placement: Placement::Direct {
            parent: parent.into(),
            side,
        },
    }
}

fn spill(user: &str, sponsor: &str, under: &str, side: Side) -> Registration {
    Registration {
        user_id: user.into(),
        sponsor_id: Some(sponsor.into()),
        placement: Placement::Extreme {
            under: under.into(),
            side,
        },
    }
}

fn investment(investor: &str, amount: i64, key: &str) -> InvestmentEvent {
    InvestmentEvent {
        investor_id: investor.into(),
        amount,
        idempotency_key: key.into(),
    }
}

/// Sponsor chain `chain[0] <- chain[1] <- ...` placed down the left leg
async fn build_chain(h: &Harness, chain: &[&str]) {
    h.system.registrar.register_root(chain[0]).await.unwrap();
    for pair in chain.windows(2) {
        h.system
            .registrar
            .register(direct(pair[1], pair[0], pair[0], Side::Left))
            .await
            .unwrap();
    }
}

/// Extra direct referrals for `sponsor`, spilled down its right leg
async fn add_directs(h: &Harness, sponsor: &str, count: usize) {
    for i in 0..count {
        let user = format!("{}-x{}", sponsor, i);
        h.system
            .registrar
            .register(spill(&user, sponsor, sponsor, Side::Right))
            .await
            .unwrap();
    }
}

fn completed(outcome: TriggerOutcome) -> lib_compensation::MatchRunReport {
    match outcome {
        TriggerOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

#[tokio::test]
async fn test_thousand_dollar_investment_pays_three_levels() {
    let h = harness();
    build_chain(&h, &["s3", "s2", "s1", "investor"]).await;
    add_directs(&h, "s2", 1).await;
    add_directs(&h, "s3", 2).await;

    let report = h
        .system
        .investments
        .process(&investment("investor", 100_000, "order-1"))
        .await
        .unwrap();

    assert_eq!(h.wallet.balance(&"s1".into()), 10_000);
    assert_eq!(h.wallet.balance(&"s2".into()), 5_000);
    assert_eq!(h.wallet.balance(&"s3".into()), 3_000);
    assert_eq!(report.distribution.total_paid, 18_000);

    for (recipient, level) in [("s1", 1u8), ("s2", 2), ("s3", 3)] {
        let records = h.store.commissions_for(&recipient.into()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, level);
        assert_eq!(records[0].source_user_id, UserId::from("investor"));
    }

    // the same event also fed the binary legs of every placement ancestor
    for ancestor in ["s1", "s2", "s3"] {
        let node = h.store.get_node(&ancestor.into()).await.unwrap().unwrap();
        assert_eq!(node.left_volume, 100_000);
        assert_eq!(node.left_unmatched, 100_000);
    }
}

#[tokio::test]
async fn test_locked_level_five_is_forfeited() {
    let h = harness();
    build_chain(&h, &["u5", "u4", "u3", "u2", "u1", "investor"]).await;
    // u_k needs k directs to earn level k; u5 stops one short
    add_directs(&h, "u2", 1).await;
    add_directs(&h, "u3", 2).await;
    add_directs(&h, "u4", 3).await;
    add_directs(&h, "u5", 3).await;
    assert_eq!(h.system.queries.unlock_status(&"u5".into()).await.unwrap().highest_unlocked, 4);

    let report = h
        .system
        .investments
        .process(&investment("investor", 100_000, "order-1"))
        .await
        .unwrap();

    assert_eq!(report.distribution.paid.len(), 4);
    assert_eq!(report.distribution.forfeited.len(), 1);
    assert_eq!(report.distribution.forfeited[0].level, 5);
    assert_eq!(report.distribution.forfeited[0].amount, apply_bps(100_000, 200));

    assert_eq!(h.wallet.balance(&"u5".into()), 0);
    assert!(h.store.commissions_for(&"u5".into()).await.unwrap().is_empty());

    // nobody received the forfeited share
    let paid: u64 = ["u1", "u2", "u3", "u4", "u5"]
        .iter()
        .map(|u| h.wallet.balance(&(*u).into()))
        .sum();
    assert_eq!(paid, 10_000 + 5_000 + 3_000 + 2_000);
}

#[tokio::test]
async fn test_uneven_legs_match_smaller_side() {
    let h = harness();
    h.system.registrar.register_root("r").await.unwrap();
    h.system.registrar.register(direct("l", "r", "r", Side::Left)).await.unwrap();
    h.system.registrar.register(direct("rt", "r", "r", Side::Right)).await.unwrap();

    h.system.investments.process(&investment("l", 30_000, "e1")).await.unwrap();
    h.system.investments.process(&investment("rt", 15_000, "e2")).await.unwrap();
    let level_income = h.wallet.balance(&"r".into());
    assert_eq!(level_income, 3_000 + 1_500);

    let report = completed(h.system.scheduler.trigger_manual(None).await.unwrap());
    assert_eq!(report.users_matched, 1);
    assert_eq!(report.total_matched_volume, 15_000);
    assert_eq!(report.total_payout, 1_500);

    let stats = h.system.queries.binary_stats(&"r".into()).await.unwrap().unwrap();
    assert_eq!((stats.left_unmatched, stats.right_unmatched), (15_000, 0));
    assert_eq!((stats.left_volume, stats.right_volume), (30_000, 15_000));
    assert_eq!(stats.total_matches, 1);
    assert_eq!(stats.total_payout, 1_500);
    assert_eq!(h.wallet.balance(&"r".into()), level_income + 1_500);

    // nothing left to pair
    let again = completed(h.system.scheduler.trigger_manual(None).await.unwrap());
    assert_eq!(again.eligible_nodes, 0);
}

#[derive(Default)]
struct RecordingWallet {
    inner: InMemoryWallet,
    order: Mutex<Vec<UserId>>,
}

#[async_trait]
impl WalletService for RecordingWallet {
    async fn credit(&self, request: &CreditRequest) -> Result<CreditReceipt, WalletError> {
        self.order.lock().push(request.user_id.clone());
        self.inner.credit(request).await
    }
}

#[tokio::test]
async fn test_lower_earners_are_matched_first() {
    let store = MemoryStore::new();
    let wallet = Arc::new(RecordingWallet::default());
    let clock = Arc::new(ManualClock::new(NOON));
    let system = CompensationSystem::new(
        &CompensationConfig::for_testing(),
        Arc::new(store.clone()),
        wallet.clone(),
        clock,
        "node-a",
    )
    .unwrap();

    for root in ["a", "b"] {
        system.registrar.register_root(root).await.unwrap();
        for side in [Side::Left, Side::Right] {
            let child = format!("{}-{}", root, side);
            system
                .registrar
                .register(Registration {
                    user_id: child.as_str().into(),
                    sponsor_id: None,
                    placement: Placement::Direct {
                        parent: root.into(),
                        side,
                    },
                })
                .await
                .unwrap();
        }
    }

    // A earns 500, B earns 50
    for (user, amount) in [("a-left", 5_000), ("a-right", 5_000), ("b-left", 500), ("b-right", 500)] {
        system
            .investments
            .process(&investment(user, amount, &format!("first-{}", user)))
            .await
            .unwrap();
    }
    completed(system.scheduler.trigger_manual(None).await.unwrap());
    assert_eq!(store.get_node(&"a".into()).await.unwrap().unwrap().matched_to_date, 500);
    assert_eq!(store.get_node(&"b".into()).await.unwrap().unwrap().matched_to_date, 50);

    for (user, amount) in [("a-left", 1_000), ("a-right", 1_000), ("b-left", 1_000), ("b-right", 1_000)] {
        system
            .investments
            .process(&investment(user, amount, &format!("second-{}", user)))
            .await
            .unwrap();
    }
    wallet.order.lock().clear();
    completed(system.scheduler.trigger_manual(None).await.unwrap());

    assert_eq!(*wallet.order.lock(), vec![UserId::from("b"), UserId::from("a")]);
}

#[tokio::test]
async fn test_replayed_event_changes_nothing() {
    let h = harness();
    build_chain(&h, &["s1", "investor"]).await;

    let first = h
        .system
        .investments
        .process(&investment("investor", 40_000, "order-7"))
        .await
        .unwrap();
    let node_after_first = h.store.get_node(&"s1".into()).await.unwrap().unwrap();
    let balance_after_first = h.wallet.balance(&"s1".into());

    let replay = h
        .system
        .investments
        .process(&investment("investor", 40_000, "order-7"))
        .await
        .unwrap();

    assert!(!first.accumulation.duplicate);
    assert!(replay.accumulation.duplicate);
    assert_eq!(replay.distribution.duplicate_levels, vec![1]);
    assert_eq!(replay.distribution.total_paid, 0);
    assert_eq!(h.store.get_node(&"s1".into()).await.unwrap().unwrap(), node_after_first);
    assert_eq!(h.wallet.balance(&"s1".into()), balance_after_first);
}

#[tokio::test]
async fn test_replay_after_sponsor_unlocks_level_pays_nothing() {
    let h = harness();
    build_chain(&h, &["s2", "s1", "investor"]).await;

    let first = h
        .system
        .investments
        .process(&investment("investor", 100_000, "order-1"))
        .await
        .unwrap();
    assert_eq!(first.distribution.forfeited.len(), 1);
    assert_eq!(first.distribution.forfeited[0].level, 2);

    add_directs(&h, "s2", 1).await;
    assert_eq!(h.system.queries.unlock_status(&"s2".into()).await.unwrap().highest_unlocked, 2);

    let replay = h
        .system
        .investments
        .process(&investment("investor", 100_000, "order-1"))
        .await
        .unwrap();

    assert!(replay.accumulation.duplicate);
    assert!(replay.distribution.paid.is_empty());
    assert_eq!(replay.distribution.duplicate_levels, vec![1, 2]);
    assert_eq!(h.wallet.balance(&"s2".into()), 0);
    assert!(h.store.commissions_for(&"s2".into()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_carry_forward_never_exceeds_volume() {
    let mut config = CompensationConfig::for_testing();
    config.binary.daily_cap = Some(7_000);
    let h = harness_with(config, MemoryStore::new(), "node-a");

    h.system.registrar.register_root("root").await.unwrap();
    for i in 0..6 {
        let side = if i % 2 == 0 { Side::Left } else { Side::Right };
        h.system
            .registrar
            .register(spill(&format!("m{}", i), "root", "root", side))
            .await
            .unwrap();
    }

    let mut key = 0;
    for round in 0..4u64 {
        for i in 0..6u64 {
            key += 1;
            let amount = ((i + 1) * 1_000 + round * 250) as i64;
            h.system
                .investments
                .process(&investment(&format!("m{}", i), amount, &format!("evt-{}", key)))
                .await
                .unwrap();
        }
        completed(h.system.scheduler.trigger_manual(None).await.unwrap());
        h.clock.advance(6 * 3_600);
    }

    for node in h.store.scan_nodes().await.unwrap() {
        assert!(node.invariants_hold(), "invariant broken for {}", node.user_id);
        let history = h.store.match_history(&node.user_id, None).await.unwrap();
        let matched: u64 = history.iter().map(|r| r.matched_volume).sum();
        assert_eq!(node.left_volume - node.left_unmatched, matched);
        assert_eq!(node.right_volume - node.right_unmatched, matched);
        let paid: u64 = history.iter().map(|r| r.payout_amount).sum();
        assert_eq!(node.matched_to_date, paid);
    }
}

#[tokio::test]
async fn test_failed_credit_is_reconciled_later() {
    let h = harness();
    h.system.registrar.register_root("r").await.unwrap();
    h.system.registrar.register(direct("l", "r", "r", Side::Left)).await.unwrap();
    h.system.registrar.register(direct("rt", "r", "r", Side::Right)).await.unwrap();
    h.system.investments.process(&investment("l", 10_000, "e1")).await.unwrap();
    h.system.investments.process(&investment("rt", 10_000, "e2")).await.unwrap();
    let before = h.wallet.balance(&"r".into());

    h.wallet.fail_for("r");
    let report = completed(h.system.scheduler.trigger_scheduled(None).await.unwrap());
    assert_eq!(report.credit_failures, 1);

    // the ledger keeps the match; the money is owed
    let pending = h.system.queries.pending_credits(&"r".into()).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].amount, 1_000);
    assert!(pending[0].attempts >= 2, "scheduled run retries once after the batch");
    assert_eq!(h.wallet.balance(&"r".into()), before);

    h.wallet.heal(&"r".into());
    let reconciled = h.system.reconciler.retry_pending_credits().await.unwrap();
    assert_eq!(reconciled.succeeded, 1);
    assert_eq!(h.wallet.balance(&"r".into()), before + 1_000);

    // a second pass has nothing left to do
    let idle = h.system.reconciler.retry_pending_credits().await.unwrap();
    assert_eq!(idle.attempted, 0);
    assert_eq!(h.wallet.balance(&"r".into()), before + 1_000);
}

#[tokio::test]
async fn test_lease_blocks_second_instance_until_expiry() {
    let store = MemoryStore::new();
    let a = harness_with(CompensationConfig::for_testing(), store.clone(), "node-a");
    a.system.registrar.register_root("r").await.unwrap();

    let held = lease::acquire(&store, "binary-matching", "node-b", NOON, 60).await.unwrap();
    assert!(matches!(held, LeaseAcquisition::Acquired(_)));

    let blocked = a.system.scheduler.trigger_scheduled(None).await.unwrap();
    assert!(matches!(blocked, TriggerOutcome::LeaseHeld { ref holder, .. } if holder == "node-b"));
    assert!(store.completed_run("2024-01-02").await.unwrap().is_none());

    a.clock.advance(61);
    completed(a.system.scheduler.trigger_scheduled(None).await.unwrap());
    assert!(store.completed_run("2024-01-02").await.unwrap().is_some());
    assert!(matches!(
        a.system.scheduler.trigger_scheduled(None).await.unwrap(),
        TriggerOutcome::AlreadyCompleted { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_investments_lose_no_volume() {
    let h = harness();
    h.system.registrar.register_root("root").await.unwrap();
    for i in 0..24 {
        let side = if i % 2 == 0 { Side::Left } else { Side::Right };
        h.system
            .registrar
            .register(spill(&format!("m{}", i), "root", "root", side))
            .await
            .unwrap();
    }
    let system = Arc::new(h.system);

    let mut tasks = Vec::new();
    for i in 0..24 {
        let system = system.clone();
        tasks.push(tokio::spawn(async move {
            system
                .investments
                .process(&investment(&format!("m{}", i), 100, &format!("evt-{}", i)))
                .await
        }));
    }
    for task in tasks {
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.accumulation.ancestors_failed, 0);
    }

    let root = h.store.get_node(&"root".into()).await.unwrap().unwrap();
    assert_eq!(root.left_volume, 1_200);
    assert_eq!(root.right_volume, 1_200);
    assert_eq!(root.left_unmatched, 1_200);
    assert_eq!(root.right_unmatched, 1_200);
}

#[tokio::test]
async fn test_sled_backed_flow_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("compensation");
    let wallet = InMemoryWallet::new();

    {
        let store = Arc::new(SledStore::open(&path).unwrap());
        let system = CompensationSystem::new(
            &CompensationConfig::for_testing(),
            store.clone(),
            Arc::new(wallet.clone()),
            Arc::new(ManualClock::new(NOON)),
            "node-a",
        )
        .unwrap();

        system.registrar.register_root("r").await.unwrap();
        system.registrar.register(direct("l", "r", "r", Side::Left)).await.unwrap();
        system.registrar.register(direct("rt", "r", "r", Side::Right)).await.unwrap();
        system.investments.process(&investment("l", 30_000, "e1")).await.unwrap();
        system.investments.process(&investment("rt", 15_000, "e2")).await.unwrap();
        completed(system.scheduler.trigger_scheduled(None).await.unwrap());
        store.flush().await.unwrap();
    }

    let store = SledStore::open(&path).unwrap();
    let node = store.get_node(&"r".into()).await.unwrap().unwrap();
    assert_eq!((node.left_unmatched, node.right_unmatched), (15_000, 0));
    assert_eq!(node.matched_to_date, 1_500);
    assert_eq!(store.direct_count(&"r".into()).await.unwrap(), 2);
    assert_eq!(store.match_history(&"r".into(), None).await.unwrap().len(), 1);
    assert_eq!(store.commissions_for(&"r".into()).await.unwrap().len(), 2);
    assert!(store.completed_run("2024-01-02").await.unwrap().is_some());
    assert!(store.pending_credits().await.unwrap().is_empty());
    assert_eq!(wallet.balance(&"r".into()), 3_000 + 1_500 + 1_500);
}

#[tokio::test]
async fn test_deferred_wallet_keeps_payouts_pending_across_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("compensation");
    let mut config = CompensationConfig::for_testing();
    config.scheduler.reconcile_after_run = false;

    {
        let store = Arc::new(SledStore::open(&path).unwrap());
        let system = CompensationSystem::new(
            &config,
            store.clone(),
            Arc::new(DeferredWallet),
            Arc::new(ManualClock::new(NOON)),
            "node-a",
        )
        .unwrap();

        system.registrar.register_root("r").await.unwrap();
        system.registrar.register(direct("l", "r", "r", Side::Left)).await.unwrap();
        system.registrar.register(direct("rt", "r", "r", Side::Right)).await.unwrap();
        system.investments.process(&investment("l", 30_000, "e1")).await.unwrap();
        system.investments.process(&investment("rt", 15_000, "e2")).await.unwrap();
        let report = completed(system.scheduler.trigger_scheduled(None).await.unwrap());
        assert_eq!(report.credit_failures, 1);
        store.flush().await.unwrap();
    }

    let store = Arc::new(SledStore::open(&path).unwrap());
    let pending = store.pending_credits().await.unwrap();
    assert_eq!(pending.len(), 3);
    assert_eq!(pending.iter().map(|c| c.amount).sum::<u64>(), 3_000 + 1_500 + 1_500);

    let wallet = InMemoryWallet::new();
    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(wallet.clone()),
        Arc::new(ManualClock::new(NOON + 60)),
        Duration::from_secs(1),
    );
    let settled = reconciler.retry_pending_credits().await.unwrap();
    assert_eq!(settled.succeeded, 3);
    assert_eq!(wallet.balance(&"r".into()), 6_000);
    assert!(store.pending_credits().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_report_serializes_to_json() {
    let h = harness();
    h.system.registrar.register_root("r").await.unwrap();
    let report = completed(h.system.scheduler.trigger_manual(None).await.unwrap());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["users_processed"], 0);
    assert_eq!(json["cancelled"], false);
    assert!(json["run_id"].as_str().is_some());
}

#[test]
fn test_shipped_node_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../compensation-node/configs/default.toml");
    let config = CompensationConfig::load_from_file(path).unwrap();
    let defaults = CompensationConfig::default();

    assert_eq!(config.binary, defaults.binary);
    assert_eq!(config.level_income, defaults.level_income);
    assert_eq!(config.unlock, defaults.unlock);
    assert_eq!(config.storage, defaults.storage);
    assert_eq!(config.scheduler.interval_secs, 3_600);
}
