//! The armed/active automation engine.
//!
//! Evaluates the designated stop's cached predictions on a fixed tick,
//! derives windows, and transitions between armed and active at most once
//! per boundary. `active` is the intended state derived from windows;
//! `confirmed_active` tracks the last successfully delivered effect, and
//! the two are reconciled on later ticks when they diverge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::AutomationConfig;
use common::{
    ActionKind, AutomationConfigSummary, AutomationStatus, PredictionQuery, Result, WindowSummary,
};
use predictions::{CacheReadOptions, PredictionCache};
use tracing::{debug, info, warn};

use crate::executor::{ActionContext, ActionDelivery};
use crate::windows::build_windows;

const RESTORE_REASON: &str = "Train window elapsed";

#[derive(Default)]
struct EngineState {
    active: bool,
    confirmed_active: Option<bool>,
    last_error: Option<String>,
    last_evaluated_at: Option<DateTime<Utc>>,
    last_changed_at: Option<DateTime<Utc>>,
    last_action: Option<ActionKind>,
    last_action_at: Option<DateTime<Utc>>,
    last_action_error: Option<String>,
    current_window: Option<WindowSummary>,
    next_window: Option<WindowSummary>,
}

pub struct VolumeAutomation {
    cfg: AutomationConfig,
    cache: PredictionCache,
    delivery: Arc<dyn ActionDelivery>,
    state: Mutex<EngineState>,
    tick_running: AtomicBool,
}

impl VolumeAutomation {
    pub fn new(
        cfg: AutomationConfig,
        cache: PredictionCache,
        delivery: Arc<dyn ActionDelivery>,
    ) -> Self {
        Self {
            cfg: cfg.clamped(),
            cache,
            delivery,
            state: Mutex::new(EngineState::default()),
            tick_running: AtomicBool::new(false),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn query(&self) -> PredictionQuery {
        PredictionQuery {
            stop_id: self.cfg.stop_id.clone(),
            route_type: Some(self.cfg.route_type),
            route_id: Some(self.cfg.route_id.clone()),
            limit: self.cfg.result_limit,
        }
    }

    /// Tick forever at the configured interval. A tick that finds the
    /// previous one still running is skipped, never stacked.
    pub async fn run(self: Arc<Self>) {
        if !self.cfg.enabled {
            info!("Automation disabled");
            return;
        }

        info!(
            "Automation watching {} ({}) on route {} every {}s",
            self.cfg.stop_name, self.cfg.stop_id, self.cfg.route_id, self.cfg.poll_seconds
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.cfg.poll_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        if !self.cfg.enabled {
            return;
        }
        if self
            .tick_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Skipping tick: previous evaluation still running");
            return;
        }

        self.evaluate_at(Utc::now()).await;
        self.tick_running.store(false, Ordering::SeqCst);
    }

    /// One evaluation against `now`. Separated from `tick` so tests can
    /// drive the state machine with fixed clocks.
    async fn evaluate_at(&self, now: DateTime<Utc>) {
        let opts = CacheReadOptions {
            force_refresh: false,
            allow_stale: true,
        };

        let hit = match self.cache.get(&self.query(), opts).await {
            Ok(hit) => hit,
            Err(e) => {
                // No usable data at all — record and leave the state as-is.
                warn!("Automation predictions fetch failed: {}", e);
                let mut st = self.state.lock().unwrap();
                st.last_error = Some(e.to_string());
                st.last_evaluated_at = Some(now);
                return;
            }
        };

        let windows = build_windows(&hit.payload.predictions, &self.cfg);
        let current = windows.iter().find(|w| w.contains(now)).cloned();
        let next = windows.iter().find(|w| w.start_at > now).cloned();

        let pending = {
            let mut st = self.state.lock().unwrap();
            st.last_error = None;
            st.last_evaluated_at = Some(now);
            st.current_window = current.as_ref().map(|w| w.summarize());
            st.next_window = next.as_ref().map(|w| w.summarize());

            if let (Some(window), false) = (&current, st.active) {
                st.active = true;
                st.last_changed_at = Some(now);
                Some((
                    ActionKind::Raise,
                    window.summary.clone(),
                    Some(window.summarize()),
                ))
            } else if current.is_none() && st.active {
                st.active = false;
                st.last_changed_at = Some(now);
                Some((ActionKind::Restore, RESTORE_REASON.to_string(), None))
            } else if st.last_action.is_some() && st.confirmed_active != Some(st.active) {
                // Intended and confirmed state diverged (failed delivery or
                // manual override) — re-deliver the intended action.
                let action = if st.active {
                    ActionKind::Raise
                } else {
                    ActionKind::Restore
                };
                let reason = match action {
                    ActionKind::Raise => current
                        .as_ref()
                        .map(|w| w.summary.clone())
                        .unwrap_or_else(|| "Reasserting raised level".to_string()),
                    ActionKind::Restore => RESTORE_REASON.to_string(),
                };
                Some((action, reason, st.current_window.clone()))
            } else {
                None
            }
        };

        if let Some((action, reason, window)) = pending {
            // Outcome lands on the state either way; the tick moves on.
            let _ = self.run_action(action, reason, window, false).await;
        }
    }

    /// Manual override: same delivery path and bookkeeping, no window
    /// derivation, and no effect on the armed/active tracking.
    pub async fn trigger_manual(&self, action: ActionKind) -> Result<AutomationStatus> {
        self.run_action(action, "manual-test".to_string(), None, true)
            .await?;
        Ok(self.status())
    }

    async fn run_action(
        &self,
        action: ActionKind,
        reason: String,
        window: Option<WindowSummary>,
        manual: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let ctx = {
            let mut st = self.state.lock().unwrap();
            st.last_action = Some(action);
            st.last_action_at = Some(now);
            st.last_action_error = None;

            ActionContext {
                action,
                reason,
                manual,
                active: st.active,
                stop_id: self.cfg.stop_id.clone(),
                stop_name: self.cfg.stop_name.clone(),
                route_id: self.cfg.route_id.clone(),
                triggered_at: now,
                window,
            }
        };

        info!("Running {} action: {}", action.as_str(), ctx.reason);

        match self.delivery.perform(&ctx).await {
            Ok(()) => {
                let mut st = self.state.lock().unwrap();
                st.confirmed_active = Some(action.effect());
                Ok(())
            }
            Err(e) => {
                warn!("{} delivery failed: {}", action.as_str(), e);
                let mut st = self.state.lock().unwrap();
                st.last_action_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn status(&self) -> AutomationStatus {
        let st = self.state.lock().unwrap();
        AutomationStatus {
            enabled: self.cfg.enabled,
            active: st.active,
            confirmed_active: st.confirmed_active,
            config: AutomationConfigSummary {
                stop_id: self.cfg.stop_id.clone(),
                stop_name: self.cfg.stop_name.clone(),
                route_id: self.cfg.route_id.clone(),
                lead_minutes: self.cfg.lead_minutes,
                pass_seconds: self.cfg.pass_seconds,
                poll_seconds: self.cfg.poll_seconds,
                has_webhook: !self.cfg.webhook_url.is_empty(),
                has_raise_command: !self.cfg.raise_command.is_empty(),
                has_restore_command: !self.cfg.restore_command.is_empty(),
            },
            last_error: st.last_error.clone(),
            last_evaluated_at: st.last_evaluated_at,
            last_changed_at: st.last_changed_at,
            last_action: st.last_action,
            last_action_at: st.last_action_at,
            last_action_error: st.last_action_error.clone(),
            current_window: st.current_window.clone(),
            next_window: st.next_window.clone(),
        }
    }
}
