//! Reconciliation engine: merges scraped contests into the store, decides
//! which notification thresholds are due, and drives the serialized polling
//! loop that forwards notifications to the chat channel.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Local, NaiveDateTime};
use herald_adapters::{default_sources, ContestSource};
use herald_core::{ContestInfo, ContestRecord, Threshold};
use herald_storage::{
    ContestStore, FetchError, HttpClientConfig, HttpFetcher, StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "herald-sync";

#[derive(Debug, Clone)]
pub struct HeraldConfig {
    pub store_path: PathBuf,
    pub webhook_url: Option<String>,
    pub mention: String,
    pub poll_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl HeraldConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("HERALD_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./herald-store.json")),
            webhook_url: std::env::var("HERALD_WEBHOOK_URL").ok(),
            mention: std::env::var("HERALD_MENTION")
                .unwrap_or_else(|_| "@everyone".to_string()),
            poll_cron: std::env::var("HERALD_POLL_CRON")
                .unwrap_or_else(|_| "0 0/5 * * * *".to_string()),
            http_timeout_secs: std::env::var("HERALD_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("HERALD_USER_AGENT")
                .unwrap_or_else(|_| "contest-herald/0.1".to_string()),
        }
    }
}

pub fn http_from_config(config: &HeraldConfig) -> anyhow::Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: StdDuration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

pub fn engine_from_config(config: &HeraldConfig) -> Engine {
    Engine::new(ContestStore::open(&config.store_path), default_sources())
}

/// One produced notification: the threshold it fired for and the text to
/// hand to the chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub uid: String,
    pub threshold: Threshold,
    pub text: String,
}

/// First matching lead-time bucket for a record, or `None` when the record is
/// not due or the due threshold was already consumed. The buckets are
/// mutually exclusive and checked finest-first, so a contest discovered late
/// fires only the tightest applicable threshold.
fn due_threshold(record: &ContestRecord, now: NaiveDateTime) -> Option<Threshold> {
    let delta = record.contest.start_time - now;
    if delta <= Duration::minutes(15) {
        (!record.notified_15min).then_some(Threshold::FifteenMinutes)
    } else if delta <= Duration::hours(1) {
        (!record.notified_1hr).then_some(Threshold::OneHour)
    } else if record.contest.start_time.date() == now.date() {
        (!record.notified_today).then_some(Threshold::Today)
    } else {
        None
    }
}

fn notification_text(contest: &ContestInfo, threshold: Threshold) -> String {
    match threshold {
        Threshold::FifteenMinutes => format!(
            "{} starting in 15 minutes!\nLink: {}",
            contest.fullname(),
            contest.link
        ),
        Threshold::OneHour => format!(
            "{} starting in an hour!\nLink: {}",
            contest.fullname(),
            contest.link
        ),
        // Day-of notifications carry the full contest card.
        Threshold::Today => contest.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct UpdateSummary {
    pub inserted: usize,
    pub updated: usize,
    pub pruned: Vec<String>,
    pub failed_sources: Vec<&'static str>,
}

/// Owns the store and the source set. One instance is wired at startup and
/// drives every cycle; cycles are serialized by the scheduler, so the store
/// never sees concurrent writers.
pub struct Engine {
    store: ContestStore,
    sources: Vec<Box<dyn ContestSource>>,
}

impl Engine {
    pub fn new(store: ContestStore, sources: Vec<Box<dyn ContestSource>>) -> Self {
        Self { store, sources }
    }

    pub fn store(&self) -> &ContestStore {
        &self.store
    }

    /// Fetches every source and merges the results into the store, then
    /// prunes contests that have started. A failing source is logged and
    /// contributes nothing this cycle; only store failures abort the update.
    pub async fn update(
        &self,
        http: &HttpFetcher,
        now: NaiveDateTime,
    ) -> Result<UpdateSummary, StoreError> {
        let mut summary = UpdateSummary::default();
        for source in &self.sources {
            let platform = source.platform();
            match source.upcoming_contests(http).await {
                Ok(contests) => {
                    let merged = self.store.merge(&contests).await?;
                    summary.inserted += merged.inserted;
                    summary.updated += merged.updated;
                }
                Err(err) => {
                    warn!(platform, error = %err, "source fetch failed; keeping stored contests");
                    summary.failed_sources.push(platform);
                }
            }
        }
        summary.pruned = self.store.prune(now).await?;
        Ok(summary)
    }

    /// Decides due notifications from one store snapshot. Each produced
    /// notification has its flags persisted before it is returned, so a
    /// threshold can never fire twice even if delivery or the process dies
    /// right after.
    pub async fn compute_notifications(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<Notification>, StoreError> {
        let records = self.store.records().await?;
        let mut notifications = Vec::new();
        for (uid, record) in &records {
            let Some(threshold) = due_threshold(record, now) else {
                continue;
            };
            let mut updated = record.clone();
            updated.mark(threshold);
            self.store
                .set_flags(
                    uid,
                    updated.notified_today,
                    updated.notified_1hr,
                    updated.notified_15min,
                )
                .await?;
            info!(%uid, ?threshold, "notifying");
            notifications.push(Notification {
                uid: uid.clone(),
                threshold,
                text: notification_text(&record.contest, threshold),
            });
        }
        Ok(notifications)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Chat delivery boundary. At-least-once, non-transactional: the engine
/// never retries a failed send within a cycle.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), DeliveryError>;
}

/// Discord webhook channel, with an optional mention line prepended to every
/// message.
pub struct DiscordWebhook {
    http: HttpFetcher,
    url: String,
    mention: String,
}

impl DiscordWebhook {
    pub fn new(http: HttpFetcher, url: impl Into<String>, mention: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            mention: mention.into(),
        }
    }
}

#[async_trait]
impl ChatChannel for DiscordWebhook {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        let content = if self.mention.is_empty() {
            text.to_string()
        } else {
            format!("{}\n{}", self.mention, text)
        };
        self.http
            .post_json(&self.url, &serde_json::json!({ "content": content }))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    pub run_id: Uuid,
    pub produced: usize,
    pub delivered: usize,
}

/// One full poll cycle: update, decide, deliver. Delivery failures are
/// logged and skipped; the already-persisted flags stand, trading a lost
/// message for the guarantee of no duplicate spam.
pub async fn run_cycle(
    engine: &Engine,
    http: &HttpFetcher,
    channel: &dyn ChatChannel,
    now: NaiveDateTime,
) -> Result<CycleOutcome, StoreError> {
    let run_id = Uuid::new_v4();
    info!(%run_id, "update cycle starting");
    let summary = engine.update(http, now).await?;
    info!(
        %run_id,
        inserted = summary.inserted,
        updated = summary.updated,
        pruned = summary.pruned.len(),
        failed_sources = summary.failed_sources.len(),
        "update cycle finished"
    );

    let notifications = engine.compute_notifications(now).await?;
    let mut delivered = 0usize;
    for notification in &notifications {
        match channel.send(&notification.text).await {
            Ok(()) => delivered += 1,
            Err(err) => warn!(
                %run_id,
                uid = %notification.uid,
                error = %err,
                "delivery failed; threshold stays consumed"
            ),
        }
    }

    Ok(CycleOutcome {
        run_id,
        produced: notifications.len(),
        delivered,
    })
}

async fn guarded_cycle(
    engine: &Engine,
    http: &HttpFetcher,
    channel: &dyn ChatChannel,
) -> anyhow::Result<()> {
    match run_cycle(engine, http, channel, Local::now().naive_local()).await {
        Ok(outcome) => {
            info!(
                run_id = %outcome.run_id,
                produced = outcome.produced,
                delivered = outcome.delivered,
                "cycle complete"
            );
            Ok(())
        }
        Err(err) if err.is_corruption() => {
            Err(anyhow::Error::new(err).context("contest store is corrupt; refusing to continue"))
        }
        Err(err) => {
            error!(error = %err, "cycle failed; waiting for next tick");
            Ok(())
        }
    }
}

/// Runs cycles until interrupted. The cron job only enqueues ticks into a
/// one-slot queue consumed by this task, so cycles are strictly serialized: a
/// tick arriving while a cycle is still running is dropped with a warning
/// instead of overlapping it.
pub async fn run_scheduler(
    config: &HeraldConfig,
    engine: Engine,
    http: HttpFetcher,
    channel: Box<dyn ChatChannel>,
) -> anyhow::Result<()> {
    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);

    let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.poll_cron.clone();
    let job = Job::new(cron.as_str(), move |_id, _scheduler| {
        if tick_tx.try_send(()).is_err() {
            warn!("previous cycle still running; skipping tick");
        }
    })
    .with_context(|| format!("creating poll job for cron {cron}"))?;
    scheduler.add(job).await.context("adding poll job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(cron = %config.poll_cron, store = %engine.store().path().display(), "herald started");

    // First cycle immediately; the channel is connected by now.
    guarded_cycle(&engine, &http, channel.as_ref()).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            tick = tick_rx.recv() => {
                if tick.is_none() {
                    break;
                }
                guarded_cycle(&engine, &http, channel.as_ref()).await?;
            }
        }
    }

    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
