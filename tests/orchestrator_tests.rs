mod common;

use chrono::{Duration, Utc};
use common::*;
use lockup_sweeper::amount::Amount;
use lockup_sweeper::error::BotError;
use lockup_sweeper::ledger::Operation;
use lockup_sweeper::store::WalletStore;
use lockup_sweeper::types::{WalletPatch, WalletStatus};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(seeded_ledger(), store, RecordingAlerts::new());

    assert!(!orchestrator.is_running().await);
    orchestrator.start(run_config(2, 2)).await.unwrap();
    assert!(orchestrator.is_running().await);

    let second = orchestrator.start(run_config(2, 2)).await;
    assert!(matches!(second, Err(BotError::AlreadyRunning)));

    assert!(orchestrator.stop().await);
    assert!(!orchestrator.stop().await);
    assert!(!orchestrator.is_running().await);

    // Restart after a clean stop
    orchestrator.start(run_config(2, 2)).await.unwrap();
    assert!(orchestrator.stop_and_drain().await);
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(seeded_ledger(), store, RecordingAlerts::new());

    let mut config = run_config(1, 1);
    config.recipient = String::new();
    assert!(matches!(
        orchestrator.start(config).await,
        Err(BotError::InvalidConfig(_))
    ));

    let mut config = run_config(1, 1);
    config.sponsor_phrases.push("definitely not a phrase".to_string());
    assert!(matches!(
        orchestrator.start(config).await,
        Err(BotError::InvalidConfig(_))
    ));

    assert!(!orchestrator.is_running().await);
}

#[tokio::test]
async fn test_status_reports_sponsors() {
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(seeded_ledger(), store, RecordingAlerts::new());

    let idle = orchestrator.status().await;
    assert!(!idle.running);
    assert!(idle.sponsors.is_empty());

    orchestrator.start(run_config(3, 2)).await.unwrap();
    let status = orchestrator.status().await;
    assert!(status.running);
    assert_eq!(status.sponsors.len(), 3);
    assert!(status.sponsors.iter().all(|s| !s.busy));
    assert_eq!(status.in_flight, 0);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_tick_requires_running_bot() {
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(seeded_ledger(), store, RecordingAlerts::new());

    assert!(matches!(orchestrator.tick().await, Err(BotError::NotRunning)));
}

#[tokio::test]
async fn test_tick_launches_up_to_concurrency_limit() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    for seed in 30..35 {
        let wallet = phrase(seed);
        ledger.fund(&public_key(&wallet), "3");
        store
            .upsert(WalletPatch::new(wallet).status(WalletStatus::Pending))
            .await
            .unwrap();
    }

    // Three sponsors but only two workers
    orchestrator.start(run_config(3, 2)).await.unwrap();
    let launched = orchestrator.tick().await.unwrap();
    assert_eq!(launched, 2);

    orchestrator.stop_and_drain().await;

    let summary = store.summary().await.unwrap();
    assert_eq!(summary.count(WalletStatus::Success), 2);
    assert_eq!(summary.count(WalletStatus::AwaitingExecution), 3);
    assert_eq!(summary.count(WalletStatus::Executing), 0);

    // Queue is served in insertion order
    let first = store.find(&phrase(30)).await.unwrap().unwrap();
    let second = store.find(&phrase(31)).await.unwrap().unwrap();
    assert_eq!(first.status, WalletStatus::Success);
    assert_eq!(second.status, WalletStatus::Success);
    assert_ne!(first.sponsor_public_key, second.sponsor_public_key);
}

#[tokio::test]
async fn test_tick_with_empty_queue_launches_nothing() {
    let (store, _temp_dir) = temp_store().await;
    let ledger = seeded_ledger();
    let orchestrator = build_orchestrator(ledger.clone(), store, RecordingAlerts::new());

    orchestrator.start(run_config(2, 2)).await.unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 0);
    orchestrator.stop_and_drain().await;

    assert!(ledger.submissions().is_empty());
}

#[tokio::test]
async fn test_force_run_errors() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger, store.clone(), RecordingAlerts::new());

    let wallet = phrase(40);
    assert!(matches!(
        orchestrator.force_run(&wallet).await,
        Err(BotError::NotRunning)
    ));

    orchestrator.start(run_config(1, 1)).await.unwrap();
    assert!(matches!(
        orchestrator.force_run(&wallet).await,
        Err(BotError::UnknownWallet)
    ));

    store
        .upsert(WalletPatch::new(wallet.clone()).status(WalletStatus::Executing))
        .await
        .unwrap();
    assert!(matches!(
        orchestrator.force_run(&wallet).await,
        Err(BotError::WalletBusy)
    ));

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_force_run_completes_pipeline() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    let wallet = phrase(41);
    ledger.fund(&public_key(&wallet), "6");
    store
        .upsert(WalletPatch::new(wallet.clone()).status(WalletStatus::Scheduled))
        .await
        .unwrap();

    orchestrator.start(run_config(1, 1)).await.unwrap();
    let outcome = orchestrator.force_run(&wallet).await.unwrap();
    assert!(outcome.is_success());

    let record = store.find(&wallet).await.unwrap().unwrap();
    assert_eq!(record.status, WalletStatus::Success);
    assert_eq!(record.public_key, Some(public_key(&wallet)));
    assert_eq!(record.sponsor_public_key, Some(public_key(&phrase(1))));

    let status = orchestrator.status().await;
    assert!(status.sponsors.iter().all(|s| !s.busy));
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_maintenance_activates_idle_sponsors() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store, RecordingAlerts::new());

    // Sponsor 1 already holds plenty; sponsor 2 does not exist yet
    ledger.fund(&public_key(&phrase(1)), "10");

    orchestrator.start(run_config(2, 2)).await.unwrap();
    assert_eq!(orchestrator.run_maintenance().await.unwrap(), 1);
    assert!(ledger.account(&public_key(&phrase(2))).is_some());

    // Second pass finds nothing to do
    assert_eq!(orchestrator.run_maintenance().await.unwrap(), 0);
    orchestrator.stop().await;
}

#[tokio::test]
async fn test_schedule_new_records_stats() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    let active = phrase(50);
    ledger.fund(&public_key(&active), "2");

    let stats = orchestrator
        .schedule_new(&[active.clone(), "bogus words".to_string(), active.clone()])
        .await
        .unwrap();

    assert_eq!(stats.pending, 1);
    assert_eq!(stats.invalid, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(store.summary().await.unwrap().total, 2);
}

/// Queued wallet whose lockup ends in five minutes: its pipeline funds the
/// sponsor and then holds it until the unlock.
async fn queue_locked_wallet(ledger: &FakeLedger, store: &dyn WalletStore, seed: u8) -> String {
    let wallet = phrase(seed);
    let unlock = Utc::now() + Duration::minutes(5);
    ledger.fund(&public_key(&wallet), "1");
    ledger.add_claimable(&public_key(&wallet), &format!("lock-{}", seed), "20", unlocks_at(unlock));
    store
        .upsert(
            WalletPatch::new(wallet.clone())
                .status(WalletStatus::AwaitingExecution)
                .public_key(public_key(&wallet))
                .unlock_time(unlock),
        )
        .await
        .unwrap();
    wallet
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_wallet_is_claimed_after_unlock() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    let wallet = phrase(42);
    let wallet_key = public_key(&wallet);
    ledger.fund(&wallet_key, "1");
    ledger.add_claimable(
        &wallet_key,
        "lockup",
        "50",
        unlocks_at(Utc::now() + Duration::minutes(5)),
    );
    let recipient_before = ledger.balance(&recipient());

    let stats = orchestrator.schedule_new(&[wallet.clone()]).await.unwrap();
    assert_eq!(stats.scheduled, 1);

    orchestrator.start(run_config(1, 1)).await.unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 1);
    orchestrator.stop_and_drain().await;

    let record = store.find(&wallet).await.unwrap().unwrap();
    assert_eq!(record.status, WalletStatus::Success);
    let forwarded: Amount = "50".parse().unwrap();
    assert_eq!(ledger.balance(&recipient()), recipient_before + forwarded);

    let claimed = ledger.submissions().iter().any(|s| {
        s.request.operations.iter().any(|op| {
            matches!(op, Operation::ClaimClaimableBalance { balance_id, .. } if balance_id == "lockup")
        })
    });
    assert!(claimed);
}

#[tokio::test]
async fn test_start_requeues_interrupted_wallets() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    // Left behind by a process that died mid-run
    let wallet = phrase(43);
    ledger.fund(&public_key(&wallet), "4");
    store
        .upsert(
            WalletPatch::new(wallet.clone())
                .status(WalletStatus::Executing)
                .sponsor("GSTALESPONSOR"),
        )
        .await
        .unwrap();

    orchestrator.start(run_config(1, 1)).await.unwrap();
    let record = store.find(&wallet).await.unwrap().unwrap();
    assert_eq!(record.status, WalletStatus::AwaitingExecution);

    assert_eq!(orchestrator.tick().await.unwrap(), 1);
    orchestrator.stop_and_drain().await;

    let record = store.find(&wallet).await.unwrap().unwrap();
    assert_eq!(record.status, WalletStatus::Success);
    assert_eq!(record.sponsor_public_key, Some(public_key(&phrase(1))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_ticks_never_share_a_sponsor() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    for seed in 60..64 {
        queue_locked_wallet(&ledger, &*store, seed).await;
    }

    orchestrator.start(run_config(2, 2)).await.unwrap();
    let (a, b) = tokio::join!(orchestrator.tick(), orchestrator.tick());
    let launched = a.unwrap() + b.unwrap() + orchestrator.tick().await.unwrap();
    assert_eq!(launched, 2);

    // Both runs are parked until the unlock, so nothing frees up
    assert_eq!(orchestrator.tick().await.unwrap(), 0);

    let executing = store.list_by_status(WalletStatus::Executing).await.unwrap();
    assert_eq!(executing.len(), 2);
    let sponsors: HashSet<_> = executing
        .iter()
        .map(|w| w.sponsor_public_key.clone().unwrap())
        .collect();
    assert_eq!(sponsors.len(), 2);
    assert_eq!(
        store
            .list_by_status(WalletStatus::AwaitingExecution)
            .await
            .unwrap()
            .len(),
        2
    );

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_force_run_without_idle_sponsor() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = build_orchestrator(ledger.clone(), store.clone(), RecordingAlerts::new());

    queue_locked_wallet(&ledger, &*store, 65).await;
    let other = phrase(66);
    ledger.fund(&public_key(&other), "4");
    store
        .upsert(WalletPatch::new(other.clone()).status(WalletStatus::Pending))
        .await
        .unwrap();

    orchestrator.start(run_config(1, 1)).await.unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 1);

    assert!(matches!(
        orchestrator.force_run(&other).await,
        Err(BotError::NoSponsorAvailable)
    ));
    let record = store.find(&other).await.unwrap().unwrap();
    assert_eq!(record.status, WalletStatus::Pending);
    assert!(record.sponsor_public_key.is_none());

    orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_force_runs_take_wallet_once() {
    let ledger = seeded_ledger();
    let (store, _temp_dir) = temp_store().await;
    let orchestrator = Arc::new(build_orchestrator(
        ledger.clone(),
        store.clone(),
        RecordingAlerts::new(),
    ));

    let wallet = queue_locked_wallet(&ledger, &*store, 67).await;
    store
        .upsert(WalletPatch::new(wallet.clone()).status(WalletStatus::Scheduled))
        .await
        .unwrap();

    orchestrator.start(run_config(2, 2)).await.unwrap();
    let (a, b) = tokio::join!(orchestrator.force_run(&wallet), orchestrator.force_run(&wallet));

    let outcomes = [a, b];
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Ok(outcome) if outcome.is_success()))
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(BotError::WalletBusy)))
            .count(),
        1
    );

    let status = orchestrator.status().await;
    assert!(status.sponsors.iter().all(|s| !s.busy));
    orchestrator.stop().await;
}
