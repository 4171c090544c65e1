//! Crossing schedule engine
//!
//! Fires at fixed local times of day, toggling the crossing light between
//! GREEN and RED. A single loop computes the next due time and sleeps until
//! it, so shutdown cancels the whole schedule at once.
//!
//! Each firing is written to the audit trail and pushed outward through a
//! `ConfirmationSink` on a detached task; a slow sink never delays the next
//! firing.

use crate::domain::error::CoordinatorError;
use crate::domain::messages::ScheduleRailLightsResponse;
use crate::domain::types::{LightColor, Selector};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::{EgressSender, LightPayload};
use crate::services::audit_log::AuditLog;
use crate::services::dispatcher::{wait_for_shutdown, Dispatcher};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Colour the crossing starts in after every restart
pub const DEFAULT_CROSSING_COLOR: LightColor = LightColor::Green;

/// One firing, as handed to the sink
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub label: String,
    pub color: LightColor,
    /// `"<label> is now <STATE>"`
    pub message: String,
    pub fired_at: DateTime<Local>,
}

/// Where firings are pushed once recorded locally
#[async_trait]
pub trait ConfirmationSink: Send + Sync {
    /// Deliver a confirmation, returning a short summary for the log
    async fn deliver(&self, confirmation: &Confirmation) -> Result<String, CoordinatorError>;
}

/// Sends the new colour to every device registered under the crossing role
pub struct BroadcastSink {
    dispatcher: Dispatcher,
    role: String,
}

impl BroadcastSink {
    pub fn new(dispatcher: Dispatcher, role: impl Into<String>) -> Self {
        Self { dispatcher, role: role.into() }
    }
}

#[async_trait]
impl ConfirmationSink for BroadcastSink {
    async fn deliver(&self, confirmation: &Confirmation) -> Result<String, CoordinatorError> {
        let report = self
            .dispatcher
            .update_status(Selector::Role(self.role.clone()), confirmation.color.as_str())
            .await;
        if report.results.is_empty() {
            return Err(CoordinatorError::NotRegistered(self.role.clone()));
        }
        Ok(report.message())
    }
}

/// Parse `HH:MM` / `HH:MM:SS` entries into a sorted, de-duplicated list.
/// Unparsable entries are skipped with a warning.
pub fn parse_trigger_times(raw: &[String]) -> Vec<NaiveTime> {
    let mut times: Vec<NaiveTime> = raw
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            let parsed = NaiveTime::parse_from_str(entry, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(entry, "%H:%M"));
            match parsed {
                Ok(time) => Some(time),
                Err(e) => {
                    warn!(entry = %entry, error = %e, "schedule_time_invalid");
                    None
                }
            }
        })
        .collect();
    times.sort();
    times.dedup();
    times
}

struct Delivery {
    sink: Arc<dyn ConfirmationSink>,
    shutdown: watch::Receiver<bool>,
}

pub struct ScheduleEngine {
    label: String,
    times: Vec<NaiveTime>,
    state: Mutex<LightColor>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    delivery: Option<Delivery>,
    egress: Option<EgressSender>,
}

impl ScheduleEngine {
    pub fn new(
        label: impl Into<String>,
        times: Vec<NaiveTime>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut times = times;
        times.sort();
        times.dedup();
        Self {
            label: label.into(),
            times,
            state: Mutex::new(DEFAULT_CROSSING_COLOR),
            clock,
            audit,
            metrics,
            delivery: None,
            egress: None,
        }
    }

    /// Push every firing through `sink`; deliveries still running at shutdown are dropped
    pub fn with_sink(mut self, sink: Arc<dyn ConfirmationSink>, shutdown: watch::Receiver<bool>) -> Self {
        self.delivery = Some(Delivery { sink, shutdown });
        self
    }

    pub fn with_egress(mut self, egress: EgressSender) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn state(&self) -> LightColor {
        *self.state.lock()
    }

    /// First trigger strictly after `after`. Times that do not exist on a
    /// given day (DST gap) are skipped for that day.
    pub fn next_due(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        if self.times.is_empty() {
            return None;
        }
        let start = after.date_naive();
        // Look two days ahead so a gap day still finds tomorrow's first slot
        for offset in 0..=2 {
            let day = start + ChronoDuration::days(offset);
            for time in &self.times {
                let Some(candidate) = Local.from_local_datetime(&day.and_time(*time)).earliest()
                else {
                    continue;
                };
                if candidate > after {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Toggle, record, and push one firing. Returns the confirmation string.
    pub fn fire(&self) -> String {
        let color = {
            let mut state = self.state.lock();
            *state = state.toggled();
            *state
        };
        let confirmation = self.record(color, "schedule");
        info!(label = %self.label, color = %color, "schedule_fired");
        self.metrics.record_schedule_firing();
        self.deliver(confirmation.clone());
        confirmation.message
    }

    /// Device-reported crossing transition (ScheduleRailLights).
    ///
    /// With a status the engine adopts it when it names a colour; without
    /// one the engine toggles its own state.
    pub fn report(&self, client_type: &str, status: Option<&str>) -> ScheduleRailLightsResponse {
        let subject = if client_type.trim().is_empty() { self.label.as_str() } else { client_type.trim() };

        let shown = match status.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => match raw.parse::<LightColor>() {
                Ok(color) => {
                    *self.state.lock() = color;
                    self.publish_light(color, "device");
                    color.to_string()
                }
                Err(_) => {
                    debug!(client_type = %subject, status = %raw, "schedule_report_untracked_status");
                    raw.to_string()
                }
            },
            None => {
                let color = {
                    let mut state = self.state.lock();
                    *state = state.toggled();
                    *state
                };
                self.publish_light(color, "device");
                color.to_string()
            }
        };

        let send_out = format!("{} is now {}", subject, shown);
        self.audit.append(send_out.clone());
        info!(client_type = %subject, status = %shown, "schedule_reported");
        ScheduleRailLightsResponse { send_out, status: Some(shown) }
    }

    /// Run the schedule until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.times.is_empty() {
            info!(label = %self.label, "schedule_idle_no_times");
            wait_for_shutdown(&mut shutdown).await;
            return;
        }

        info!(label = %self.label, triggers = %self.times.len(), "schedule_started");
        let mut cursor = self.clock.now();

        loop {
            let Some(due) = self.next_due(cursor) else {
                warn!(label = %self.label, "schedule_no_next_trigger");
                wait_for_shutdown(&mut shutdown).await;
                return;
            };
            let from = self.clock.now().max(cursor);
            let wait = (due - from).to_std().unwrap_or(Duration::ZERO);
            debug!(due = %due, wait_ms = %wait.as_millis(), "schedule_waiting");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!(label = %self.label, "schedule_stopped");
                    return;
                }
            }

            self.fire();
            // A clock step past several triggers schedules only the next future one
            cursor = self.clock.now().max(due);
        }
    }

    fn record(&self, color: LightColor, source: &str) -> Confirmation {
        let message = format!("{} is now {}", self.label, color);
        let entry = self.audit.append(message.clone());
        self.publish_light(color, source);
        Confirmation { label: self.label.clone(), color, message, fired_at: entry.timestamp }
    }

    fn publish_light(&self, color: LightColor, source: &str) {
        if let Some(ref egress) = self.egress {
            egress.send_light(LightPayload {
                site: None,
                ts: self.clock.now().timestamp_millis(),
                role: self.label.clone(),
                id: None,
                color: color.to_string(),
                src: source.to_string(),
            });
        }
    }

    fn deliver(&self, confirmation: Confirmation) {
        let Some(ref delivery) = self.delivery else {
            return;
        };
        let sink = delivery.sink.clone();
        let mut shutdown = delivery.shutdown.clone();
        let audit = self.audit.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = sink.deliver(&confirmation) => match result {
                    Ok(summary) => {
                        info!(label = %confirmation.label, summary = %summary, "schedule_confirmation_delivered");
                    }
                    Err(e) => {
                        warn!(label = %confirmation.label, error = %e, "schedule_confirmation_failed");
                        audit.append(format!("Confirmation of {} failed: {}", confirmation.message, e));
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!(label = %confirmation.label, "schedule_confirmation_cancelled");
                }
            }
        });
    }
}
