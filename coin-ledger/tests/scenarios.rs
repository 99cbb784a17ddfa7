//! End-to-end ledger scenarios against both backends

use coin_ledger::{
    AccountId, Config, CreditOutcome, Error, Ledger, Metered, Quote, StorageBackend, UsageKind,
};
use std::sync::Arc;
#[cfg(feature = "rocksdb-store")]
use tempfile::TempDir;

fn memory_ledger_config() -> Config {
    Config {
        backend: StorageBackend::Memory,
        ..Config::default()
    }
}

async fn memory_ledger() -> Ledger {
    Ledger::open(memory_ledger_config()).await.unwrap()
}

#[cfg(feature = "rocksdb-store")]
async fn rocks_ledger() -> (Ledger, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        backend: StorageBackend::RocksDb,
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    (Ledger::open(config).await.unwrap(), dir)
}

async fn funded(ledger: &Ledger, name: &str, balance: u64) -> AccountId {
    let id = AccountId::new(name);
    ledger.ensure_account(&id).await.unwrap();
    if balance > 0 {
        ledger.store().credit(&id, balance).await.unwrap();
    }
    id
}

/// Payment confirmation applied, then replayed
async fn scenario_duplicate_webhook(ledger: &Ledger) {
    let id = funded(ledger, "scenario-a", 0).await;

    let first = ledger.intake().apply_credit("evt-1", &id, 100).await.unwrap();
    assert_eq!(first, CreditOutcome::Applied { new_balance: 100 });

    let replay = ledger.intake().apply_credit("evt-1", &id, 100).await.unwrap();
    assert_eq!(replay, CreditOutcome::AlreadyApplied);
    assert_eq!(ledger.balance(&id).await.unwrap(), 100);
}

/// Upfront charge whose work fails is refunded
async fn scenario_upfront_failure(ledger: &Ledger) {
    let id = funded(ledger, "scenario-b", 50).await;

    let result = ledger
        .gate()
        .charge_upfront(&id, UsageKind::Transcription, Quote::new(900, 30), || async {
            Err::<String, _>(anyhow::anyhow!("transcription provider returned 503"))
        })
        .await;

    assert!(matches!(result, Err(Error::UpstreamFailure(_))));
    assert_eq!(ledger.balance(&id).await.unwrap(), 50);
    assert!(ledger.usage(&id).await.unwrap().is_empty());
}

/// Post-work charge the balance cannot cover discards the artifact
async fn scenario_after_cost_rejected(ledger: &Ledger) {
    let id = funded(ledger, "scenario-c", 5).await;

    let result = ledger
        .gate()
        .charge_after(&id, UsageKind::DocumentGeneration, || async {
            Ok(Metered::new("generated document".to_string(), Quote::new(400, 20)))
        })
        .await;

    assert!(matches!(
        result,
        Err(Error::InsufficientBalance { required: 20, available: 5 })
    ));
    assert_eq!(ledger.balance(&id).await.unwrap(), 5);
    assert!(ledger.usage(&id).await.unwrap().is_empty());
}

/// Ten simultaneous full-balance charges; exactly one wins
async fn scenario_concurrent_full_balance(ledger: Arc<Ledger>) {
    let id = funded(&ledger, "scenario-d", 10).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .gate()
                .charge_upfront(&id, UsageKind::Transcription, Quote::new(200, 10), || async {
                    Ok(())
                })
                .await
        }));
    }

    let mut charged = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result.new_balance, 0);
                charged += 1;
            }
            Err(Error::InsufficientBalance { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(charged, 1);
    assert_eq!(rejected, 9);
    assert_eq!(ledger.balance(&id).await.unwrap(), 0);
    assert_eq!(ledger.usage(&id).await.unwrap().len(), 1);
}

/// Interleaved debits and credits conserve coins
async fn scenario_mixed_traffic(ledger: Arc<Ledger>) {
    let id = funded(&ledger, "scenario-mixed", 100).await;

    let mut handles = Vec::new();
    for worker in 0..8u64 {
        let ledger = ledger.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let mut spent = 0u64;
            let mut earned = 0u64;
            for round in 0..25u64 {
                let amount = (worker + round) % 7 + 1;
                if round % 3 == 0 {
                    ledger.store().credit(&id, amount).await.unwrap();
                    earned += amount;
                } else if ledger.store().try_debit(&id, amount).await.is_ok() {
                    spent += amount;
                }
            }
            (spent, earned)
        }));
    }

    let mut spent = 0;
    let mut earned = 0;
    for handle in handles {
        let (s, e) = handle.await.unwrap();
        spent += s;
        earned += e;
    }
    assert_eq!(ledger.balance(&id).await.unwrap(), 100 + earned - spent);
}

#[tokio::test]
async fn test_duplicate_webhook_memory() {
    scenario_duplicate_webhook(&memory_ledger().await).await;
}

#[cfg(feature = "rocksdb-store")]
#[tokio::test]
async fn test_duplicate_webhook_rocksdb() {
    let (ledger, _dir) = rocks_ledger().await;
    scenario_duplicate_webhook(&ledger).await;
}

#[tokio::test]
async fn test_upfront_failure_memory() {
    scenario_upfront_failure(&memory_ledger().await).await;
}

#[cfg(feature = "rocksdb-store")]
#[tokio::test]
async fn test_upfront_failure_rocksdb() {
    let (ledger, _dir) = rocks_ledger().await;
    scenario_upfront_failure(&ledger).await;
}

#[tokio::test]
async fn test_after_cost_rejected_memory() {
    scenario_after_cost_rejected(&memory_ledger().await).await;
}

#[cfg(feature = "rocksdb-store")]
#[tokio::test]
async fn test_after_cost_rejected_rocksdb() {
    let (ledger, _dir) = rocks_ledger().await;
    scenario_after_cost_rejected(&ledger).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_full_balance_memory() {
    scenario_concurrent_full_balance(Arc::new(memory_ledger().await)).await;
}

#[cfg(feature = "rocksdb-store")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_full_balance_rocksdb() {
    let (ledger, _dir) = rocks_ledger().await;
    scenario_concurrent_full_balance(Arc::new(ledger)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_traffic_memory() {
    scenario_mixed_traffic(Arc::new(memory_ledger().await)).await;
}

#[cfg(feature = "rocksdb-store")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_traffic_rocksdb() {
    let (ledger, _dir) = rocks_ledger().await;
    scenario_mixed_traffic(Arc::new(ledger)).await;
}

#[cfg(feature = "rocksdb-store")]
#[tokio::test]
async fn test_rocksdb_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        backend: StorageBackend::RocksDb,
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    let id = AccountId::new("durable");
    let code = {
        let ledger = Ledger::open(config.clone()).await.unwrap();
        let account = ledger.ensure_account(&id).await.unwrap();
        ledger.intake().apply_credit("pay-9", &id, 500).await.unwrap();
        ledger
            .gate()
            .charge_upfront(&id, UsageKind::CertificationStorage, Quote::new(3, 12), || async {
                Ok(())
            })
            .await
            .unwrap();
        account.unique_code
    };

    let ledger = Ledger::open(config).await.unwrap();
    assert_eq!(ledger.balance(&id).await.unwrap(), 488);
    assert_eq!(ledger.usage(&id).await.unwrap().len(), 1);
    assert_eq!(
        ledger.intake().apply_credit("pay-9", &id, 500).await.unwrap(),
        CreditOutcome::AlreadyApplied
    );
    assert_eq!(ledger.gift(&code, 2).await.unwrap().balance, 490);
}
