//! Orchestrator
//!
//! Owns the bot lifecycle. While running, a tick loop drives
//! Scheduler → Assignment → pipeline launches and a slower maintenance loop
//! keeps idle sponsors funded. Launched pipelines are tracked so shutdown can
//! optionally wait for them, but the tick loop never awaits them.

use crate::alert::AlertSink;
use crate::assignment;
use crate::config::{EngineSettings, RunConfig};
use crate::error::BotError;
use crate::intake;
use crate::keys::Keypair;
use crate::ledger::{LedgerGateway, SequenceLocks};
use crate::maintenance;
use crate::pipeline;
use crate::scheduler;
use crate::sponsor_pool::SponsorPool;
use crate::store::WalletStore;
use crate::types::{BotStatus, ScheduleStats, TaskOutcome, WalletPatch, WalletStatus, truncate_key};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Everything one run of the bot closes over. Built at start from a config
/// snapshot and shared by every component call of that run.
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub settings: EngineSettings,
    pub funder: Keypair,
    pub pool: SponsorPool,
    pub ledger: Arc<dyn LedgerGateway>,
    pub store: Arc<dyn WalletStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub sequences: SequenceLocks,
    funding_failures: AtomicU32,
}

impl RunContext {
    /// Derives the funder and sponsor identities from `config`.
    pub fn new(
        config: RunConfig,
        settings: EngineSettings,
        ledger: Arc<dyn LedgerGateway>,
        store: Arc<dyn WalletStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Result<Self, BotError> {
        let funder = Keypair::from_phrase(&config.funding_phrase)
            .map_err(|e| BotError::Derivation(format!("funder: {:#}", e)))?;

        let sponsors = config
            .sponsor_phrases
            .iter()
            .enumerate()
            .map(|(i, phrase)| {
                Keypair::from_phrase(phrase)
                    .map_err(|e| BotError::Derivation(format!("sponsor #{}: {:#}", i + 1, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config: Arc::new(config),
            settings,
            funder,
            pool: SponsorPool::new(sponsors),
            ledger,
            store,
            alerts,
            sequences: SequenceLocks::new(),
            funding_failures: AtomicU32::new(0),
        })
    }

    /// Effective concurrency: the configured limit, capped by pool size.
    pub fn concurrency_limit(&self) -> usize {
        self.config.concurrent_workers.min(self.pool.len())
    }

    /// Returns the number of consecutive funding failures including this one.
    pub fn record_funding_failure(&self) -> u32 {
        self.funding_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_funding_success(&self) {
        self.funding_failures.store(0, Ordering::Release);
    }
}

struct ActiveRun {
    context: Arc<RunContext>,
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

pub struct Orchestrator {
    ledger: Arc<dyn LedgerGateway>,
    store: Arc<dyn WalletStore>,
    alerts: Arc<dyn AlertSink>,
    settings: EngineSettings,
    active: Mutex<Option<ActiveRun>>,
    tracker: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        store: Arc<dyn WalletStore>,
        alerts: Arc<dyn AlertSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger,
            store,
            alerts,
            settings,
            active: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn WalletStore> {
        &self.store
    }

    pub async fn start(&self, config: RunConfig) -> Result<(), BotError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(BotError::AlreadyRunning);
        }
        // A new pool re-derives the same identities; wait until the previous
        // run's pipelines have given theirs back.
        if !self.tracker.is_empty() {
            return Err(BotError::Draining(self.tracker.len()));
        }

        config.validate().map_err(BotError::InvalidConfig)?;

        // Nothing is in flight, so any EXECUTING record lost its pipeline.
        let requeued = requeue_interrupted(self.store.as_ref()).await?;
        if requeued > 0 {
            warn!("Requeued {} wallet(s) interrupted mid-run", requeued);
        }

        let context = Arc::new(RunContext::new(
            config,
            self.settings,
            Arc::clone(&self.ledger),
            Arc::clone(&self.store),
            Arc::clone(&self.alerts),
        )?);

        info!(
            "Starting bot: funder {}, {} sponsor(s), concurrency {}",
            truncate_key(context.funder.public_key()),
            context.pool.len(),
            context.concurrency_limit()
        );

        let shutdown = CancellationToken::new();
        let loops = vec![
            tokio::spawn(tick_loop(
                Arc::clone(&context),
                self.tracker.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(maintenance_loop(Arc::clone(&context), shutdown.clone())),
        ];

        *active = Some(ActiveRun {
            context,
            shutdown,
            loops,
        });
        Ok(())
    }

    /// Halt future ticks. In-flight pipelines keep running to finalize.
    pub async fn stop(&self) -> bool {
        let Some(run) = self.active.lock().await.take() else {
            return false;
        };

        info!("Stopping bot ({} pipeline run(s) in flight)", self.tracker.len());
        run.shutdown.cancel();
        for handle in run.loops {
            if let Err(e) = handle.await {
                warn!("Loop task ended abnormally: {}", e);
            }
        }
        true
    }

    /// Stop, then wait for every in-flight pipeline to finalize.
    pub async fn stop_and_drain(&self) -> bool {
        let stopped = self.stop().await;
        self.drain().await;
        stopped
    }

    /// Wait until every tracked pipeline run has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn status(&self) -> BotStatus {
        let active = self.active.lock().await;
        BotStatus {
            running: active.is_some(),
            sponsors: active
                .as_ref()
                .map(|run| run.context.pool.statuses())
                .unwrap_or_default(),
            in_flight: self.tracker.len(),
        }
    }

    async fn context(&self) -> Option<Arc<RunContext>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|run| Arc::clone(&run.context))
    }

    /// One Scheduler + Assignment pass. Returns the number of launched runs.
    pub async fn tick(&self) -> Result<usize, BotError> {
        let context = self.context().await.ok_or(BotError::NotRunning)?;
        Ok(run_tick(&context, &self.tracker).await?)
    }

    /// One maintenance pass over idle sponsors.
    pub async fn run_maintenance(&self) -> Result<usize, BotError> {
        let context = self.context().await.ok_or(BotError::NotRunning)?;
        Ok(maintenance::run_once(&context).await)
    }

    /// Classify and record newly submitted secret phrases.
    pub async fn schedule_new(&self, phrases: &[String]) -> Result<ScheduleStats, BotError> {
        info!("Received {} phrase(s) for scheduling", phrases.len());
        let stats =
            intake::schedule_new(self.ledger.as_ref(), self.store.as_ref(), phrases, Utc::now())
                .await?;
        Ok(stats)
    }

    /// Run the full pipeline for one wallet right now, bypassing the queue.
    pub async fn force_run(&self, secret_phrase: &str) -> Result<TaskOutcome, BotError> {
        let context = self.context().await.ok_or(BotError::NotRunning)?;
        let wallet = self
            .store
            .find(secret_phrase)
            .await?
            .ok_or(BotError::UnknownWallet)?;
        if wallet.status == WalletStatus::Executing {
            return Err(BotError::WalletBusy);
        }
        let target = Keypair::from_phrase(&wallet.secret_phrase)
            .map_err(|e| BotError::Derivation(format!("{:#}", e)))?;

        let lease = context
            .pool
            .acquire_any()
            .ok_or(BotError::NoSponsorAvailable)?;

        // Another tick or force run may have claimed the wallet since the
        // lookup; only a non-EXECUTING record can be taken.
        let claimable: Vec<WalletStatus> = WalletStatus::ALL
            .into_iter()
            .filter(|status| *status != WalletStatus::Executing)
            .collect();
        let patch = WalletPatch::new(wallet.secret_phrase)
            .public_key(target.public_key())
            .status(WalletStatus::Executing)
            .sponsor(lease.public_key());
        let Some(wallet) = self.store.upsert_if(patch, &claimable).await? else {
            lease.release();
            return Err(BotError::WalletBusy);
        };

        info!(
            "Force run: sponsor {} -> wallet {}",
            truncate_key(lease.public_key()),
            truncate_key(target.public_key())
        );

        // Run on the tracker so a dropped caller cannot cut the pipeline
        // short of finalize.
        let run = self
            .tracker
            .spawn(async move { pipeline::run(&context, wallet, lease).await });

        Ok(run.await.unwrap_or_else(|e| {
            error!("Force run task failed: {}", e);
            TaskOutcome::Failed(format!("internal error: {}", e))
        }))
    }
}

/// Move every `EXECUTING` record back to `AWAITING_EXECUTION`. Only valid
/// while no pipeline is in flight.
async fn requeue_interrupted(store: &dyn WalletStore) -> Result<usize> {
    let mut requeued = 0;
    for wallet in store.list_by_status(WalletStatus::Executing).await? {
        let patch = WalletPatch::new(wallet.secret_phrase)
            .status(WalletStatus::AwaitingExecution)
            .reason("requeued after an interrupted run");
        if store
            .upsert_if(patch, &[WalletStatus::Executing])
            .await?
            .is_some()
        {
            info!(
                "Requeued wallet {:?} (was bound to sponsor {:?})",
                wallet.public_key.as_deref().map(truncate_key),
                wallet.sponsor_public_key.as_deref().map(truncate_key)
            );
            requeued += 1;
        }
    }
    Ok(requeued)
}

async fn run_tick(context: &Arc<RunContext>, tracker: &TaskTracker) -> Result<usize> {
    scheduler::promote_due(context.store.as_ref(), Utc::now(), context.settings.lookahead)
        .await?;

    let assignments = assignment::assign(context).await?;
    let launched = assignments.len();

    for assignment::Assignment { wallet, lease } in assignments {
        let context = Arc::clone(context);
        tracker.spawn(async move {
            pipeline::run(&context, wallet, lease).await;
        });
    }

    Ok(launched)
}

async fn tick_loop(context: Arc<RunContext>, tracker: TaskTracker, shutdown: CancellationToken) {
    let period = context.settings.tick_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Orchestrator loop started (interval: {:?})", period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => {
                if let Err(e) = run_tick(&context, &tracker).await {
                    error!("Error in orchestrator tick: {:#}", e);
                }
            }
        }
    }
    info!("Orchestrator loop stopped");
}

async fn maintenance_loop(context: Arc<RunContext>, shutdown: CancellationToken) {
    let period = context.settings.maintenance_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticks.tick() => {
                maintenance::run_once(&context).await;
            }
        }
    }
    info!("Maintenance loop stopped");
}
