//! Heartbeat leases over submissions.
//!
//! A lease is the pair `(judge_name, judge_ping)` on a submission row. It is
//! live while `now < judge_ping + LEASE_TTL`; an expired lease is simply
//! unowned and can be claimed again by anyone, its old holder included.
//! Every claim and renewal is a compare-and-swap inside one database
//! transaction, so correctness holds across independent worker processes.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time after which an unrenewed lease expires
pub const LEASE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Take an unowned or expired lease, or refresh our own
    Claim,
    /// Only refresh a lease we still hold
    Renew,
}

/// Whether `judge_name` holds a live lease at `now`
pub fn is_registered(
    judge_name: &str,
    judge_ping: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    !judge_name.is_empty()
        && judge_ping.is_some_and(|ping| {
            ping.checked_add_signed(ttl)
                .is_none_or(|expiry| now < expiry)
        })
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp {s:?}"))?
        .with_timezone(&Utc))
}

/// Claims and renews leases on behalf of one worker identity
#[derive(Debug, Clone)]
pub struct LeaseManager {
    pool: SqlitePool,
    worker: String,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(pool: SqlitePool, worker: impl Into<String>) -> Self {
        Self {
            pool,
            worker: worker.into(),
            ttl: LEASE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns `false` when another worker holds a live lease
    pub async fn try_claim(&self, id: i64) -> Result<bool> {
        self.update_registration(id, LeaseMode::Claim, Utc::now())
            .await
    }

    /// Returns `false` when this worker no longer holds a live lease
    pub async fn renew(&self, id: i64) -> Result<bool> {
        self.update_registration(id, LeaseMode::Renew, Utc::now())
            .await
    }

    pub async fn try_claim_at(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        self.update_registration(id, LeaseMode::Claim, now).await
    }

    pub async fn renew_at(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        self.update_registration(id, LeaseMode::Renew, now).await
    }

    /// Check-then-write on the lease fields inside one transaction
    ///
    /// The UPDATE is guarded on the exact values read, so a concurrent
    /// writer that slipped in between turns this into a lost race rather
    /// than a double owner. Never retries.
    async fn update_registration(
        &self,
        id: i64,
        mode: LeaseMode,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query("SELECT judge_name, judge_ping FROM submissions WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.as_mut())
            .await?
        else {
            bail!("Submission {id} not found");
        };
        let owner: String = row.try_get("judge_name")?;
        let ping_text: Option<String> = row.try_get("judge_ping")?;
        let ping = ping_text.as_deref().map(parse_timestamp).transpose()?;

        let registered = is_registered(&owner, ping, now, self.ttl);
        if registered && owner != self.worker {
            log::debug!("Submission {id} is held by {owner}");
            return Ok(false);
        }
        let myself = registered && owner == self.worker;
        if mode == LeaseMode::Renew && !myself {
            log::debug!("Lease of {} on submission {id} has lapsed", self.worker);
            return Ok(false);
        }

        let updated = sqlx::query(
            r#"
            UPDATE submissions
            SET judge_name = ?, judge_ping = ?
            WHERE id = ? AND judge_name = ? AND judge_ping IS ?
            "#,
        )
        .bind(&self.worker)
        .bind(crate::format_timestamp(now))
        .bind(id)
        .bind(&owner)
        .bind(ping_text)
        .execute(tx.as_mut())
        .await?
        .rows_affected();

        if updated == 0 {
            log::debug!("Lost the race for submission {id}");
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Renews the lease every `interval` until aborted
    ///
    /// When a renewal is refused, `lost` is cancelled and the task ends.
    /// Store errors are logged and retried on the next tick; if they persist
    /// the lease expires and the next renewal is refused.
    pub fn spawn_heartbeat(
        &self,
        id: i64,
        interval: Duration,
        lost: CancellationToken,
    ) -> JoinHandle<()> {
        let lease = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // The claim itself was the first beat

            loop {
                tokio::select! {
                    _ = lost.cancelled() => break,
                    _ = ticker.tick() => {
                        match lease.renew(id).await {
                            Ok(true) => log::debug!("Renewed lease on submission {id}"),
                            Ok(false) => {
                                log::warn!("{} lost its lease on submission {id}", lease.worker);
                                lost.cancel();
                                break;
                            }
                            Err(e) => log::warn!("Failed to renew lease on submission {id}: {e:#}"),
                        }
                    }
                }
            }
        })
    }
}
