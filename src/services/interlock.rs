//! Barrier interlock - sensor to barrier safety state machine
//!
//! States: UP (initial) and DOWN. The state only changes after the barrier
//! device acknowledges a command, and the whole read-command-write sequence
//! runs under one async mutex so concurrent sensor calls never produce a
//! second command or a lost update.
//!
//! ```text
//! detected=true,  UP   -> lower -> ack: DOWN | fail: UP
//! detected=true,  DOWN -> no-op
//! detected=false, DOWN -> raise -> ack: UP   | fail: DOWN
//! detected=false, UP   -> no-op
//! no barrier registered -> report, state unchanged
//! ```

use crate::domain::error::{CoordinatorError, DeviceError};
use crate::domain::messages::{ControlBarrierRequest, MessageResponse};
use crate::domain::types::{BarrierState, DeviceRecord};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::io::device_link::DeviceLink;
use crate::io::egress_channel::{BarrierPayload, EgressSender};
use crate::services::audit_log::AuditLog;
use crate::services::registry::DeviceRegistry;
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Interlock-side view of the barrier
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BarrierStatus {
    pub state: BarrierState,
    /// Who triggered the last successful transition
    pub last_source: Option<String>,
    pub changed_at: Option<DateTime<Local>>,
}

/// Result of one sensor signal
#[derive(Debug, Clone, PartialEq)]
pub enum InterlockOutcome {
    Lowered,
    Raised,
    AlreadyDown,
    AlreadyUp,
    NoBarrier { train_detected: bool },
    CommandFailed { train_detected: bool, error: CoordinatorError },
}

impl InterlockOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            InterlockOutcome::Lowered => "Train detected, barrier lowered.",
            InterlockOutcome::AlreadyDown => "Train detected, barrier already down.",
            InterlockOutcome::Raised => "Train passed, barrier raised.",
            InterlockOutcome::AlreadyUp => "Train passed, barrier already up.",
            InterlockOutcome::NoBarrier { train_detected: true } => {
                "Train detected, but no barrier client connected."
            }
            InterlockOutcome::NoBarrier { train_detected: false } => {
                "Train passed, but no barrier client connected."
            }
            InterlockOutcome::CommandFailed { train_detected: true, .. } => {
                "Train detected, but barrier control failed."
            }
            InterlockOutcome::CommandFailed { train_detected: false, .. } => {
                "Train passed, but barrier control failed."
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Command {
    Lower,
    Raise,
}

impl Command {
    fn request(self) -> ControlBarrierRequest {
        match self {
            Command::Lower => ControlBarrierRequest::lower(),
            Command::Raise => ControlBarrierRequest::raise(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Command::Lower => "lower",
            Command::Raise => "raise",
        }
    }

    fn target(self) -> BarrierState {
        match self {
            Command::Lower => BarrierState::Down,
            Command::Raise => BarrierState::Up,
        }
    }
}

pub struct BarrierInterlock {
    status: Mutex<BarrierStatus>,
    registry: Arc<DeviceRegistry>,
    link: Arc<dyn DeviceLink>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    egress: Option<EgressSender>,
    barrier_role: String,
    timeout: Duration,
}

impl BarrierInterlock {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        link: Arc<dyn DeviceLink>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        barrier_role: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        metrics.set_barrier_state(BarrierState::Up);
        Self {
            status: Mutex::new(BarrierStatus::default()),
            registry,
            link,
            audit,
            metrics,
            clock,
            egress: None,
            barrier_role: barrier_role.into(),
            timeout,
        }
    }

    pub fn with_egress(mut self, egress: EgressSender) -> Self {
        self.egress = Some(egress);
        self
    }

    pub async fn status(&self) -> BarrierStatus {
        self.status.lock().await.clone()
    }

    /// Handle one sensor signal from `source`
    pub async fn trigger_sensor(&self, train_detected: bool, source: &str) -> InterlockOutcome {
        // Held until the state write so a second signal waits for the ack
        let mut status = self.status.lock().await;

        let Some(barrier) = self.registry.latest_for_role(&self.barrier_role) else {
            let outcome = InterlockOutcome::NoBarrier { train_detected };
            warn!(source = %source, train_detected = %train_detected, "interlock_no_barrier");
            self.audit.append(outcome.message());
            let command = if train_detected { Command::Lower } else { Command::Raise };
            self.publish(status.state, command, &outcome, source);
            return outcome;
        };

        let command = match (train_detected, status.state) {
            (true, BarrierState::Up) => Command::Lower,
            (false, BarrierState::Down) => Command::Raise,
            (true, BarrierState::Down) => {
                self.metrics.record_sensor_noop();
                info!(source = %source, "interlock_already_down");
                return InterlockOutcome::AlreadyDown;
            }
            (false, BarrierState::Up) => {
                self.metrics.record_sensor_noop();
                info!(source = %source, "interlock_already_up");
                return InterlockOutcome::AlreadyUp;
            }
        };

        let start = Instant::now();
        let result = self.send(&barrier, command).await;
        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_barrier_command(result.is_ok());

        let outcome = match result {
            Ok(reply) => {
                status.state = command.target();
                status.last_source = Some(source.to_string());
                status.changed_at = Some(self.clock.now());
                self.metrics.set_barrier_state(status.state);
                info!(
                    barrier = %barrier.key,
                    source = %source,
                    command = %command.as_str(),
                    state = %status.state,
                    reply = %reply.message,
                    latency_us = %latency_us,
                    "interlock_transition"
                );
                match command {
                    Command::Lower => InterlockOutcome::Lowered,
                    Command::Raise => InterlockOutcome::Raised,
                }
            }
            Err(e) => {
                let error = CoordinatorError::downstream(&barrier.key, e);
                warn!(
                    barrier = %barrier.key,
                    source = %source,
                    command = %command.as_str(),
                    state = %status.state,
                    error = %error,
                    latency_us = %latency_us,
                    "interlock_command_failed"
                );
                InterlockOutcome::CommandFailed { train_detected, error }
            }
        };

        match &outcome {
            InterlockOutcome::CommandFailed { error, .. } => {
                self.audit.append(format!("{} ({})", outcome.message(), error));
            }
            _ => {
                self.audit.append(outcome.message());
            }
        }
        self.publish(status.state, command, &outcome, source);
        outcome
    }

    async fn send(&self, barrier: &DeviceRecord, command: Command) -> Result<MessageResponse, DeviceError> {
        let request = command.request();
        match tokio::time::timeout(self.timeout, self.link.control_barrier(barrier, &request)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    fn publish(&self, state: BarrierState, command: Command, outcome: &InterlockOutcome, source: &str) {
        if let Some(ref egress) = self.egress {
            egress.send_barrier(BarrierPayload {
                site: None,
                ts: self.clock.now().timestamp_millis(),
                state: state.to_string(),
                cmd: command.as_str().to_string(),
                ok: !matches!(
                    outcome,
                    InterlockOutcome::CommandFailed { .. } | InterlockOutcome::NoBarrier { .. }
                ),
                src: source.to_string(),
            });
        }
    }
}

/// Reply of a barrier device to ControlBarrier. Never touches interlock state.
pub fn barrier_reply(request: &ControlBarrierRequest) -> MessageResponse {
    let message = if request.lower_barrier { "The barrier is down." } else { "The barrier is up." };
    info!(
        lower_barrier = %request.lower_barrier,
        status = %request.status,
        "barrier_control_received"
    );
    MessageResponse::new(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::messages::UpdateLightStatusRequest;
    use crate::domain::types::DeviceKey;
    use crate::infra::clock::SystemClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Barrier fake counting commands, optionally slow or failing
    #[derive(Default)]
    struct FakeBarrier {
        lowers: AtomicUsize,
        raises: AtomicUsize,
        fail: AtomicBool,
        delay_ms: u64,
    }

    #[async_trait]
    impl DeviceLink for FakeBarrier {
        async fn update_light_status(
            &self,
            _device: &DeviceRecord,
            _request: &UpdateLightStatusRequest,
        ) -> Result<MessageResponse, DeviceError> {
            Ok(MessageResponse::new("unused"))
        }

        async fn control_barrier(
            &self,
            _device: &DeviceRecord,
            request: &ControlBarrierRequest,
        ) -> Result<MessageResponse, DeviceError> {
            if request.lower_barrier {
                self.lowers.fetch_add(1, Ordering::SeqCst);
            } else {
                self.raises.fetch_add(1, Ordering::SeqCst);
            }
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeviceError::Unreachable("connection refused".to_string()));
            }
            Ok(barrier_reply(request))
        }
    }

    fn interlock(link: Arc<FakeBarrier>, register: bool) -> (Arc<BarrierInterlock>, Arc<AuditLog>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::new(DeviceRegistry::new(clock.clone()));
        if register {
            registry.register(DeviceKey::role_only("train_barrier"), "http://barrier:50052".into());
        }
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        let interlock = BarrierInterlock::new(
            registry,
            link,
            audit.clone(),
            Arc::new(Metrics::new()),
            clock,
            "train_barrier",
            Duration::from_millis(500),
        );
        (Arc::new(interlock), audit)
    }

    #[tokio::test]
    async fn test_lower_then_raise() {
        let link = Arc::new(FakeBarrier::default());
        let (interlock, audit) = interlock(link.clone(), true);

        let outcome = interlock.trigger_sensor(true, "sensor").await;
        assert_eq!(outcome, InterlockOutcome::Lowered);
        assert_eq!(outcome.message(), "Train detected, barrier lowered.");
        let status = interlock.status().await;
        assert_eq!(status.state, BarrierState::Down);
        assert_eq!(status.last_source.as_deref(), Some("sensor"));

        let outcome = interlock.trigger_sensor(false, "sensor").await;
        assert_eq!(outcome, InterlockOutcome::Raised);
        assert_eq!(interlock.status().await.state, BarrierState::Up);

        assert_eq!(link.lowers.load(Ordering::SeqCst), 1);
        assert_eq!(link.raises.load(Ordering::SeqCst), 1);
        assert!(audit.read_all().contains("Train passed, barrier raised."));
    }

    #[tokio::test]
    async fn test_concurrent_detections_send_one_lower() {
        let link = Arc::new(FakeBarrier { delay_ms: 100, ..Default::default() });
        let (interlock, _) = interlock(link.clone(), true);

        let a = tokio::spawn({
            let interlock = interlock.clone();
            async move { interlock.trigger_sensor(true, "sensor-a").await }
        });
        let b = tokio::spawn({
            let interlock = interlock.clone();
            async move { interlock.trigger_sensor(true, "sensor-b").await }
        });
        let mut outcomes = vec![a.await.unwrap(), b.await.unwrap()];
        outcomes.sort_by_key(|o| o.message());

        assert_eq!(link.lowers.load(Ordering::SeqCst), 1);
        assert_eq!(outcomes, vec![InterlockOutcome::AlreadyDown, InterlockOutcome::Lowered]);
        assert_eq!(interlock.status().await.state, BarrierState::Down);
    }

    #[tokio::test]
    async fn test_failed_lower_stays_up() {
        let link = Arc::new(FakeBarrier::default());
        link.fail.store(true, Ordering::SeqCst);
        let (interlock, audit) = interlock(link.clone(), true);

        let outcome = interlock.trigger_sensor(true, "sensor").await;
        assert_eq!(outcome.message(), "Train detected, but barrier control failed.");
        assert!(matches!(
            outcome,
            InterlockOutcome::CommandFailed {
                error: CoordinatorError::DownstreamUnavailable { .. },
                ..
            }
        ));
        assert_eq!(interlock.status().await.state, BarrierState::Up);
        assert!(audit.read_all().contains("Train detected, but barrier control failed. (Device train_barrier"));

        // A retry after recovery lowers normally
        link.fail.store(false, Ordering::SeqCst);
        assert_eq!(interlock.trigger_sensor(true, "sensor").await, InterlockOutcome::Lowered);
        assert_eq!(link.lowers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_raise_stays_down() {
        let link = Arc::new(FakeBarrier::default());
        let (interlock, _) = interlock(link.clone(), true);
        interlock.trigger_sensor(true, "sensor").await;

        link.fail.store(true, Ordering::SeqCst);
        let outcome = interlock.trigger_sensor(false, "sensor").await;
        assert_eq!(outcome.message(), "Train passed, but barrier control failed.");
        assert_eq!(interlock.status().await.state, BarrierState::Down);
    }

    #[tokio::test]
    async fn test_no_barrier_registered() {
        let link = Arc::new(FakeBarrier::default());
        let (interlock, audit) = interlock(link.clone(), false);

        let outcome = interlock.trigger_sensor(true, "sensor").await;
        assert_eq!(outcome.message(), "Train detected, but no barrier client connected.");
        assert_eq!(interlock.status().await, BarrierStatus::default());
        assert_eq!(link.lowers.load(Ordering::SeqCst), 0);
        assert!(audit.read_all().contains("no barrier client connected"));
    }

    #[tokio::test]
    async fn test_clear_signal_while_up_is_noop() {
        let link = Arc::new(FakeBarrier::default());
        let (interlock, _) = interlock(link.clone(), true);
        assert_eq!(interlock.trigger_sensor(false, "sensor").await, InterlockOutcome::AlreadyUp);
        assert_eq!(link.raises.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_barrier_reply() {
        assert_eq!(barrier_reply(&ControlBarrierRequest::lower()).message, "The barrier is down.");
        assert_eq!(barrier_reply(&ControlBarrierRequest::raise()).message, "The barrier is up.");
    }
}
