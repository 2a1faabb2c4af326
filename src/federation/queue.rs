//! Durable outbound delivery queue
//!
//! Activities fanned out to followers are stored one row per inbox and
//! drained in rounds. A round claims due rows, signs them, posts them in
//! parallel and writes failed rows back with exponential backoff.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::config::DeliveryConfig;
use crate::data::{Actor, Database, DeliveryTarget, Follower, QueueItem};
use crate::error::AppError;
use crate::federation::delivery::{ActivitySender, PreparedDelivery, post_signed};
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_QUEUE_CLAIMED, DELIVERY_ROUNDS_TOTAL};

/// Result of one posted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The inbox answered 2xx
    Delivered(reqwest::StatusCode),
    /// The inbox answered with any other status
    Rejected(reqwest::StatusCode),
    /// No answer: connection error, timeout or a crashed task
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Delivered(status) | DeliveryOutcome::Rejected(status) => {
                write!(f, "HTTP {}", status)
            }
            DeliveryOutcome::Failed(reason) => f.write_str(reason),
        }
    }
}

/// Runs a batch of signed POSTs with bounded concurrency
pub struct ParallelDispatcher {
    http_client: Arc<reqwest::Client>,
    max_concurrency: usize,
    request_timeout: Duration,
}

impl ParallelDispatcher {
    pub fn new(http_client: Arc<reqwest::Client>, max_concurrency: usize, request_timeout: Duration) -> Self {
        Self {
            http_client,
            max_concurrency: max_concurrency.max(1),
            request_timeout,
        }
    }

    /// Post every request and report each result to `on_complete`
    ///
    /// `on_complete` receives the request's index in `requests` and is
    /// called exactly once per request, in completion order.
    pub async fn dispatch<F>(&self, requests: Vec<PreparedDelivery>, mut on_complete: F)
    where
        F: FnMut(usize, DeliveryOutcome),
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut pending: HashSet<usize> = (0..requests.len()).collect();
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let http_client = self.http_client.clone();
            let timeout = self.request_timeout;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();

                let outcome = match post_signed(&http_client, &request, timeout).await {
                    Ok(status) if status.is_success() => DeliveryOutcome::Delivered(status),
                    Ok(status) => DeliveryOutcome::Rejected(status),
                    Err(e) if e.is_timeout() => DeliveryOutcome::Failed("timed out".to_string()),
                    Err(e) => DeliveryOutcome::Failed(e.to_string()),
                };
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    pending.remove(&index);
                    on_complete(index, outcome);
                }
                Err(e) => tracing::error!(error = %e, "Delivery task failed"),
            }
        }

        for index in pending {
            on_complete(index, DeliveryOutcome::Failed("delivery task aborted".to_string()));
        }
    }
}

/// Unix time of the next attempt after `retry_count` failures
pub fn next_attempt_at(now: i64, backoff_base_secs: u64, retry_count: u32) -> i64 {
    let delay = backoff_base_secs.saturating_pow(retry_count);
    now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX))
}

/// Schedule a failed item for another attempt, or `None` once it has used
/// up its attempts
pub fn apply_failure(item: &QueueItem, settings: &DeliveryConfig, now: i64) -> Option<QueueItem> {
    let retry_count = item.retry_count.saturating_add(1);
    if retry_count >= i64::from(settings.max_attempts) {
        return None;
    }

    let exponent = u32::try_from(retry_count).unwrap_or(u32::MAX);
    Some(QueueItem {
        retry_count,
        next_attempt_at: next_attempt_at(now, settings.backoff_base_secs, exponent),
        ..item.clone()
    })
}

/// One delivery target per distinct inbox.
///
/// Followers advertising a shared inbox are grouped behind it. A target
/// keeps its follower id only when it serves a single follower.
pub fn follower_targets(followers: &[Follower]) -> Vec<DeliveryTarget> {
    let mut groups: Vec<(&str, Vec<i64>)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for follower in followers {
        let inbox = follower.shared_inbox.as_deref().unwrap_or(&follower.inbox);
        match index.get(inbox) {
            Some(&position) => groups[position].1.push(follower.id),
            None => {
                index.insert(inbox, groups.len());
                groups.push((inbox, vec![follower.id]));
            }
        }
    }

    groups
        .into_iter()
        .map(|(inbox, ids)| DeliveryTarget {
            inbox: inbox.to_string(),
            follower_id: match ids.as_slice() {
                [only] => Some(*only),
                _ => None,
            },
        })
        .collect()
}

/// Totals of one drain invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub rounds: u32,
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
}

/// Delivery queue
pub struct DeliveryQueue {
    db: Arc<Database>,
    sender: Arc<ActivitySender>,
    dispatcher: ParallelDispatcher,
    settings: DeliveryConfig,
    /// Serializes claims within this process
    exclusive: Mutex<()>,
}

impl DeliveryQueue {
    pub fn new(
        db: Arc<Database>,
        sender: Arc<ActivitySender>,
        http_client: Arc<reqwest::Client>,
        settings: DeliveryConfig,
    ) -> Self {
        let dispatcher = ParallelDispatcher::new(
            http_client,
            settings.max_concurrency,
            settings.request_timeout(),
        );
        Self {
            db,
            sender,
            dispatcher,
            settings,
            exclusive: Mutex::new(()),
        }
    }

    /// Queue `activity` for each target, due immediately
    pub async fn enqueue(
        &self,
        actor_id: i64,
        activity: &Value,
        targets: &[DeliveryTarget],
    ) -> Result<u64, AppError> {
        let activity = serde_json::to_string(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {e}")))?;
        let written = self
            .db
            .enqueue_deliveries(actor_id, &activity, targets, Utc::now().timestamp())
            .await?;

        tracing::debug!(actor_id, written, "Queued activity");
        Ok(written)
    }

    /// Queue `activity` for every follower of the actor
    pub async fn enqueue_for_followers(&self, actor_id: i64, activity: &Value) -> Result<u64, AppError> {
        let followers = self.db.list_followers(actor_id).await?;
        let targets = follower_targets(&followers);

        tracing::info!(
            actor_id,
            followers = followers.len(),
            inboxes = targets.len(),
            "Queueing activity for followers"
        );
        self.enqueue(actor_id, activity, &targets).await
    }

    /// Run delivery rounds until `budget` is spent or nothing is due
    ///
    /// The budget is only checked between rounds; a round in flight
    /// always completes.
    pub async fn drain(&self, budget: Duration) -> Result<DrainReport, AppError> {
        let started = Instant::now();
        let mut report = DrainReport::default();

        while started.elapsed() < budget {
            let claimed = self.run_round(&mut report).await?;
            if claimed == 0 {
                break;
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                rounds = report.rounds,
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                dropped = report.dropped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Delivery drain finished"
            );
        }
        Ok(report)
    }

    async fn run_round(&self, report: &mut DrainReport) -> Result<usize, AppError> {
        let items = {
            let _guard = self.exclusive.lock().await;
            self.db
                .claim_due_deliveries(Utc::now().timestamp(), self.settings.batch_size)
                .await?
        };
        if items.is_empty() {
            return Ok(0);
        }

        let claimed = items.len();
        report.rounds += 1;
        report.claimed += claimed;
        DELIVERY_ROUNDS_TOTAL.inc();
        DELIVERY_QUEUE_CLAIMED.set(claimed as i64);

        // From here on every claimed item must end up delivered, requeued
        // or deliberately dropped; nothing may return early.
        let mut failed: Vec<QueueItem> = Vec::new();
        let mut requests = Vec::with_capacity(claimed);
        let mut dispatched: Vec<QueueItem> = Vec::with_capacity(claimed);
        let mut actors: HashMap<i64, Option<Actor>> = HashMap::new();

        for item in items {
            let actor = match actors.get(&item.actor_id) {
                Some(actor) => actor.clone(),
                None => match self.db.get_actor(item.actor_id).await {
                    Ok(actor) => {
                        actors.insert(item.actor_id, actor.clone());
                        actor
                    }
                    Err(e) => {
                        tracing::warn!(item = item.id, error = %e, "Failed to load delivering actor");
                        failed.push(item);
                        continue;
                    }
                },
            };

            let Some(actor) = actor else {
                tracing::debug!(item = item.id, actor_id = item.actor_id, "Dropping delivery of deleted actor");
                report.dropped += 1;
                continue;
            };

            match self
                .sender
                .prepare(&actor, &item.inbox, item.activity.clone().into_bytes())
                .await
            {
                Ok(request) => {
                    requests.push(request);
                    dispatched.push(item);
                }
                Err(e) => {
                    tracing::warn!(item = item.id, inbox = %item.inbox, error = %e, "Failed to sign delivery");
                    failed.push(item);
                }
            }
        }

        self.dispatcher
            .dispatch(requests, |index, outcome| {
                let item = &dispatched[index];
                if outcome.is_success() {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["delivered"]).inc();
                    report.delivered += 1;
                    tracing::debug!(item = item.id, inbox = %item.inbox, "Delivered queued activity");
                } else {
                    tracing::warn!(
                        item = item.id,
                        inbox = %item.inbox,
                        retry_count = item.retry_count,
                        outcome = %outcome,
                        "Queued delivery failed"
                    );
                    failed.push(item.clone());
                }
            })
            .await;

        let now = Utc::now().timestamp();
        let mut retries = Vec::with_capacity(failed.len());
        for item in &failed {
            match apply_failure(item, &self.settings, now) {
                Some(retry) => retries.push(retry),
                None => {
                    DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["dropped"]).inc();
                    report.dropped += 1;
                    tracing::warn!(
                        item = item.id,
                        inbox = %item.inbox,
                        attempts = self.settings.max_attempts,
                        "Dropping undeliverable activity"
                    );
                }
            }
        }

        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&["retried"])
            .inc_by(retries.len() as u64);
        report.retried += retries.len();
        self.db.requeue_deliveries(&retries).await?;
        DELIVERY_QUEUE_CLAIMED.set(0);

        Ok(claimed)
    }
}
