//! Periodic maintenance: fallback flush, retention cleanup and temporal
//! relationship recompute.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use trail_store::tabs::TabRepo;
use trail_store::windows::WindowRepo;

use crate::context::TrailContext;
use crate::error::Result;
use crate::reconcile::forget;
use crate::settings::{chrono_ms, ms};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tick {
    Flush,
    Cleanup,
    Relationships,
}

impl Tick {
    pub fn name(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Cleanup => "cleanup",
            Self::Relationships => "relationships",
        }
    }
}

/// Run one maintenance pass. Returns how many rows it touched.
#[instrument(skip(ctx), fields(tick = tick.name()))]
pub fn on_periodic_tick(ctx: &TrailContext, tick: Tick) -> Result<usize> {
    match tick {
        Tick::Flush => {
            let n = ctx.queue.flush()?;
            ctx.save_working_state();
            Ok(n)
        }
        Tick::Cleanup => cleanup(ctx),
        Tick::Relationships => {
            let graph = ctx.graph();
            let added = graph.recompute_temporal()?;
            let pruned = graph.prune()?;
            debug!(added, pruned, "temporal relationships recomputed");
            Ok(added + pruned)
        }
    }
}

fn cleanup(ctx: &TrailContext) -> Result<usize> {
    ctx.queue.flush()?;
    let sessions = ctx.sessions.sweep_expired()?;

    let cutoff = ctx.now() - chrono_ms(ctx.settings.cleanup.closed_retention_ms);
    let tabs = TabRepo::new(ctx.db.clone());
    let windows = WindowRepo::new(ctx.db.clone());
    let tab_ids = tabs.list_stale_closed(cutoff)?;
    let window_ids = windows.list_stale_closed(cutoff)?;
    let removed = tabs.delete_many(&tab_ids)? + windows.delete_many(&window_ids)?;
    forget(ctx, &tab_ids, &window_ids);

    if removed > 0 || !sessions.is_empty() {
        info!(sessions = sessions.len(), objects = removed, "retention cleanup");
    }
    Ok(sessions.len() + removed)
}

/// Fires every [`Tick`] on its own interval until cancelled.
pub struct Scheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn(ctx: Arc<TrailContext>, token: CancellationToken) -> Self {
        let settings = &ctx.settings;
        let mut flush = ticker(ms(settings.queue.fallback_interval_ms));
        let mut cleanup = ticker(ms(settings.cleanup.interval_ms));
        let mut relationships = ticker(ms(settings.graph.recompute_interval_ms));
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let tick = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = flush.tick() => Tick::Flush,
                    _ = cleanup.tick() => Tick::Cleanup,
                    _ = relationships.tick() => Tick::Relationships,
                };
                if let Err(e) = on_periodic_tick(&ctx, tick) {
                    warn!(tick = tick.name(), error = %e, "periodic tick failed");
                }
            }
            debug!("scheduler stopped");
        });
        Self { token, handle }
    }

    /// Stop the loop and wait for an in-progress tick to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

/// Interval whose first tick is one period out rather than immediate.
fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
