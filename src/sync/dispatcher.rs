use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::model::{ChangeSignal, Provider};
use crate::providers::ProviderSet;
use crate::sync::incremental::IncrementalSync;
use crate::sync::SyncReport;

/// Feeds webhook change signals into the incremental sync engine.
#[derive(Clone)]
pub struct SyncDispatcher {
    sync: IncrementalSync,
    providers: ProviderSet,
}

impl SyncDispatcher {
    pub fn new(sync: IncrementalSync, providers: ProviderSet) -> Self {
        Self { sync, providers }
    }

    pub async fn dispatch(&self, signal: &ChangeSignal) -> Result<SyncReport> {
        let feed = self.providers.feed(signal.provider).ok_or_else(|| {
            Error::Config(format!("{} has no change feed", signal.provider))
        })?;
        self.sync.run(&feed, &signal.user_id, Some(signal)).await
    }

    /// Spawn the consumer. Signals queued while a run is in progress are
    /// merged per user and provider before the next run.
    pub fn start(self, capacity: usize) -> (mpsc::Sender<ChangeSignal>, DispatcherHandle) {
        let (tx, mut rx) = mpsc::channel::<ChangeSignal>(capacity.max(1));
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    signal = rx.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                let mut batch = vec![first];
                while let Ok(more) = rx.try_recv() {
                    batch.push(more);
                }
                for signal in coalesce(batch) {
                    match self.dispatch(&signal).await {
                        Ok(report) => log::debug!(
                            "Signal for {} on {} handled: {}",
                            signal.user_id,
                            signal.provider,
                            report.phase.as_str()
                        ),
                        Err(e) => log::warn!(
                            "Sync for {} on {} failed: {e}",
                            signal.user_id,
                            signal.provider
                        ),
                    }
                }
            }
            log::info!("Sync dispatcher stopped");
        });

        (tx, DispatcherHandle { shutdown, task })
    }
}

/// Merge signals per `(user, provider)`: highest sequence, all receipts.
fn coalesce(signals: Vec<ChangeSignal>) -> Vec<ChangeSignal> {
    let mut merged: BTreeMap<(String, Provider), ChangeSignal> = BTreeMap::new();
    for signal in signals {
        let key = (signal.user_id.clone(), signal.provider);
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.at_least = existing.at_least.max(signal.at_least);
                existing.receipts.extend(signal.receipts);
            }
            None => {
                merged.insert(key, signal);
            }
        }
    }
    merged.into_values().collect()
}

pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Dispatcher task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReadReceipt, SyncCursor};
    use crate::providers::fake::FakeProvider;
    use crate::providers::tests::gateway_for;
    use crate::storage::{repository, Database};
    use crate::sync::SyncOptions;
    use crate::time_util::from_millis;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn signal(at_least: u64) -> ChangeSignal {
        ChangeSignal {
            user_id: "u1".into(),
            provider: Provider::Mail,
            at_least,
            receipts: vec![],
        }
    }

    #[test]
    fn test_coalesce_keeps_highest_sequence() {
        let mut a = signal(5);
        a.receipts.push(ReadReceipt {
            participant_ref: "p".into(),
            watermark: from_millis(1),
        });
        let b = signal(9);
        let other = ChangeSignal {
            user_id: "u2".into(),
            ..signal(3)
        };
        let out = coalesce(vec![a, b, other]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].at_least, 9);
        assert_eq!(out[0].receipts.len(), 1);
        assert_eq!(out[1].user_id, "u2");
    }

    #[tokio::test]
    async fn test_dispatch_without_feed_is_config_error() {
        let db = Database::open_memory().await.unwrap();
        let gateway = gateway_for(&db, Provider::Chat, "tok").await;
        let sync = IncrementalSync::new(
            db,
            gateway,
            SyncOptions::default(),
            chrono::Duration::seconds(30),
        );
        let dispatcher = SyncDispatcher::new(sync, ProviderSet::default());
        let err = dispatcher.dispatch(&signal(1)).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_signals_drive_sync_until_stopped() {
        let db = Database::open_memory().await.unwrap();
        let gateway = gateway_for(&db, Provider::Mail, "tok").await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(4, "t", "m1", 1_000, "hi");
        let sync = IncrementalSync::new(
            db.clone(),
            gateway,
            SyncOptions::default(),
            chrono::Duration::seconds(30),
        );
        let dispatcher = SyncDispatcher::new(sync, ProviderSet::default().with_feed(fake.clone()));

        let (tx, handle) = dispatcher.start(8);
        tx.send(signal(4)).await.unwrap();
        tx.send(signal(4)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        let cursor = db
            .reader()
            .call(|conn| repository::get_sync_cursor(conn, "u1", Provider::Mail))
            .await
            .unwrap();
        assert_eq!(cursor, Some(SyncCursor::from(4)));
        assert_eq!(fake.bootstrap_calls.load(Ordering::SeqCst), 1);
        assert!(tx.send(signal(5)).await.is_err());
    }
}
