//! Coordinator - one handler per RPC call
//!
//! Owns the registry, audit trail, dispatcher handle, schedule engine,
//! interlock and credential store. Every handler returns a reply body;
//! domain failures are rendered into its message and never propagate.

use crate::domain::error::CoordinatorError;
use crate::domain::messages::{
    ControlBarrierRequest, GetLogsResponse, LoginRequest, MessageResponse, RegisterClientRequest,
    ScheduleRailLightsRequest, ScheduleRailLightsResponse, TriggerSensorRequest,
    UpdateLightStatusRequest, UpdateLightStatusResponse,
};
use crate::domain::types::{roles, DeviceKey, Selector};
use crate::infra::clock::Clock;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::device_link::DeviceLink;
use crate::io::egress_channel::{DevicePayload, EgressSender};
use crate::services::audit_log::AuditLog;
use crate::services::auth::{CredentialStore, LOGIN_OK};
use crate::services::dispatcher::{
    create_dispatcher, BroadcastReport, DispatchWorker, Dispatcher, DispatcherDeps,
};
use crate::services::interlock::{barrier_reply, BarrierInterlock};
use crate::services::registry::{DeviceRegistry, Registration};
use crate::services::schedule::{parse_trigger_times, BroadcastSink, ScheduleEngine};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const DISPATCH_QUEUE_SIZE: usize = 64;

/// External collaborators the coordinator is built from
pub struct CoordinatorDeps {
    pub link: Arc<dyn DeviceLink>,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<AuditLog>,
    pub credentials: CredentialStore,
    pub metrics: Arc<Metrics>,
    pub egress: Option<EgressSender>,
    pub shutdown: watch::Receiver<bool>,
}

pub struct Coordinator {
    registry: Arc<DeviceRegistry>,
    audit: Arc<AuditLog>,
    dispatcher: Dispatcher,
    schedule: Arc<ScheduleEngine>,
    interlock: BarrierInterlock,
    credentials: CredentialStore,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    egress: Option<EgressSender>,
    light_roles: Vec<String>,
    default_port: u16,
}

impl Coordinator {
    /// Wire all components. The returned worker must be spawned for
    /// broadcasts to make progress; the schedule loop is started separately
    /// through `schedule()`.
    pub fn build(config: &Config, deps: CoordinatorDeps) -> (Arc<Self>, DispatchWorker) {
        let CoordinatorDeps { link, clock, audit, credentials, metrics, egress, shutdown } = deps;
        let timeout = Duration::from_millis(config.device_timeout_ms());
        let registry = Arc::new(DeviceRegistry::new(clock.clone()));

        let (dispatcher, worker) = create_dispatcher(
            DispatcherDeps {
                registry: registry.clone(),
                link: link.clone(),
                audit: audit.clone(),
                metrics: metrics.clone(),
                clock: clock.clone(),
                egress: egress.clone(),
                timeout,
            },
            DISPATCH_QUEUE_SIZE,
        );

        let sink = Arc::new(BroadcastSink::new(dispatcher.clone(), config.crossing_role()));
        let mut schedule = ScheduleEngine::new(
            config.schedule_label(),
            parse_trigger_times(config.schedule_times()),
            clock.clone(),
            audit.clone(),
            metrics.clone(),
        )
        .with_sink(sink, shutdown);

        let mut interlock = BarrierInterlock::new(
            registry.clone(),
            link,
            audit.clone(),
            metrics.clone(),
            clock.clone(),
            config.barrier_role(),
            timeout,
        );

        if let Some(ref egress) = egress {
            schedule = schedule.with_egress(egress.clone());
            interlock = interlock.with_egress(egress.clone());
        }

        let coordinator = Self {
            registry,
            audit,
            dispatcher,
            schedule: Arc::new(schedule),
            interlock,
            credentials,
            metrics,
            clock,
            egress,
            light_roles: config.light_roles().to_vec(),
            default_port: config.device_default_port(),
        };
        (Arc::new(coordinator), worker)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn schedule(&self) -> &Arc<ScheduleEngine> {
        &self.schedule
    }

    pub fn interlock(&self) -> &BarrierInterlock {
        &self.interlock
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// RegisterClient: upsert the caller. `peer` is used when no callback address is given.
    pub fn register_client(&self, request: RegisterClientRequest, peer: Option<IpAddr>) -> MessageResponse {
        let role = request.role.trim();
        if role.is_empty() {
            let err = CoordinatorError::InvalidRequest("role is required".to_string());
            warn!(error = %err, "register_rejected");
            return MessageResponse::new(err.to_string());
        }

        let address = match (request.address.filter(|a| !a.trim().is_empty()), peer) {
            (Some(address), _) => address.trim().to_string(),
            (None, Some(ip)) => format!("http://{}", SocketAddr::new(ip, self.default_port)),
            (None, None) => {
                let err = CoordinatorError::InvalidRequest("device address unknown".to_string());
                warn!(role = %role, error = %err, "register_rejected");
                return MessageResponse::new(err.to_string());
            }
        };

        let key = DeviceKey::new(role, request.id.map(|id| id.trim().to_string()));
        let (registration, record) = self.registry.register(key, address);
        self.metrics.record_registration();
        self.audit.append(format!("{} client connected.", role.to_uppercase()));

        if let Some(ref egress) = self.egress {
            egress.send_device(DevicePayload {
                site: None,
                ts: self.clock.now().timestamp_millis(),
                role: record.key.role.clone(),
                id: record.key.id.clone(),
                address: record.address.clone(),
                t: match registration {
                    Registration::New => "registered".to_string(),
                    Registration::Updated => "updated".to_string(),
                },
            });
        }

        MessageResponse::new(format!("Registered {} client.", role))
    }

    /// UpdateLightStatus: broadcast `status` to the selected lights
    pub async fn update_light_status(&self, request: UpdateLightStatusRequest) -> UpdateLightStatusResponse {
        let status = request.status.trim();
        if status.is_empty() {
            let err = CoordinatorError::InvalidRequest("status is required".to_string());
            return UpdateLightStatusResponse { message: err.to_string(), results: Vec::new() };
        }

        let targeted = request.role.as_deref().is_some_and(|r| !r.trim().is_empty())
            || request.id.as_deref().is_some_and(|i| !i.trim().is_empty());
        let report = match split_paired_status(status) {
            Some((north, south)) if !targeted => {
                let parts = vec![
                    self.dispatcher.update_status(Selector::Role(roles::ROAD_LIGHT_NORTH.into()), north).await,
                    self.dispatcher.update_status(Selector::Role(roles::ROAD_LIGHT_SOUTH.into()), south).await,
                ];
                let selector = Selector::Group(vec![
                    roles::ROAD_LIGHT_NORTH.to_string(),
                    roles::ROAD_LIGHT_SOUTH.to_string(),
                ]);
                BroadcastReport::merge(selector, status, parts)
            }
            _ => {
                let selector = self.selector_for(request.role.as_deref(), request.id.as_deref());
                self.dispatcher.update_status(selector, status).await
            }
        };
        UpdateLightStatusResponse { message: report.message(), results: report.results }
    }

    /// role+id: that device; role: the role; id: that id across the light group; neither: the light group
    fn selector_for(&self, role: Option<&str>, id: Option<&str>) -> Selector {
        let role = role.map(str::trim).filter(|r| !r.is_empty());
        let id = id.map(str::trim).filter(|i| !i.is_empty());
        match (role, id) {
            (Some(role), Some(id)) => Selector::Devices(vec![DeviceKey::new(role, Some(id.to_string()))]),
            (Some(role), None) => Selector::Role(role.to_string()),
            (None, Some(id)) => Selector::Devices(
                self.light_roles
                    .iter()
                    .map(|role| DeviceKey::new(role.clone(), Some(id.to_string())))
                    .collect(),
            ),
            (None, None) => Selector::Group(self.light_roles.clone()),
        }
    }

    pub fn schedule_rail_lights(&self, request: ScheduleRailLightsRequest) -> ScheduleRailLightsResponse {
        self.schedule.report(&request.client_type, request.status.as_deref())
    }

    /// ControlBarrier addressed to the coordinator itself; interlock state is untouched
    pub fn control_barrier(&self, request: ControlBarrierRequest) -> MessageResponse {
        barrier_reply(&request)
    }

    pub async fn trigger_sensor(&self, request: TriggerSensorRequest, source: &str) -> MessageResponse {
        let outcome = self.interlock.trigger_sensor(request.train_detected, source).await;
        MessageResponse::new(outcome.message())
    }

    pub fn login(&self, request: LoginRequest) -> MessageResponse {
        match self.credentials.login(&request.username, &request.password) {
            Ok(_) => {
                self.metrics.record_login(true);
                info!(username = %request.username, "login_succeeded");
                MessageResponse::new(LOGIN_OK)
            }
            Err(e) => {
                self.metrics.record_login(false);
                warn!(username = %request.username, reason = %e, "login_failed");
                MessageResponse::new(e.to_string())
            }
        }
    }

    pub fn get_logs(&self) -> GetLogsResponse {
        GetLogsResponse { logs: self.audit.read_all() }
    }
}

/// `"<north> to <south>"` names one colour per road light
fn split_paired_status(status: &str) -> Option<(&str, &str)> {
    let (north, south) = status.split_once(" to ")?;
    let (north, south) = (north.trim(), south.trim());
    if north.is_empty() || south.is_empty() {
        return None;
    }
    Some((north, south))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DeviceError;
    use crate::domain::types::DeviceRecord;
    use crate::infra::clock::SystemClock;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingLink {
        light_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceLink for RecordingLink {
        async fn update_light_status(
            &self,
            device: &DeviceRecord,
            request: &UpdateLightStatusRequest,
        ) -> Result<MessageResponse, DeviceError> {
            self.light_calls.lock().push(format!("{}={}", device.key, request.status));
            Ok(MessageResponse::new("ok"))
        }

        async fn control_barrier(
            &self,
            _device: &DeviceRecord,
            request: &ControlBarrierRequest,
        ) -> Result<MessageResponse, DeviceError> {
            Ok(barrier_reply(request))
        }
    }

    fn coordinator(link: Arc<RecordingLink>) -> (Arc<Coordinator>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let deps = CoordinatorDeps {
            link,
            clock: clock.clone(),
            audit: Arc::new(AuditLog::in_memory(clock.clone())),
            credentials: CredentialStore::default(),
            metrics: Arc::new(Metrics::new()),
            egress: None,
            shutdown: shutdown_rx.clone(),
        };
        let (coordinator, worker) = Coordinator::build(&Config::default(), deps);
        tokio::spawn(worker.run(shutdown_rx));
        (coordinator, shutdown_tx)
    }

    fn register(c: &Coordinator, role: &str, id: Option<&str>) -> MessageResponse {
        c.register_client(
            RegisterClientRequest {
                role: role.to_string(),
                id: id.map(str::to_string),
                address: Some(format!("http://{}:50052", role)),
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_register_messages_and_peer_address() {
        let (c, _shutdown) = coordinator(Arc::new(RecordingLink::default()));

        assert_eq!(register(&c, "road_light", None).message, "Registered road_light client.");
        let reply = c.register_client(RegisterClientRequest::default(), None);
        assert_eq!(reply.message, "Invalid request: role is required");

        let peer: IpAddr = "10.1.2.3".parse().unwrap();
        c.register_client(
            RegisterClientRequest { role: "sensor".into(), id: None, address: None },
            Some(peer),
        );
        assert_eq!(c.registry().lookup("sensor", None).unwrap().address, "http://10.1.2.3:50052");
        assert!(c.get_logs().logs.contains("SENSOR client connected."));
    }

    #[tokio::test]
    async fn test_update_without_role_targets_light_group() {
        let link = Arc::new(RecordingLink::default());
        let (c, _shutdown) = coordinator(link.clone());
        register(&c, "road_light_north", None);
        register(&c, "road_light_south", None);
        register(&c, "rail_light", None);

        let reply = c
            .update_light_status(UpdateLightStatusRequest { status: "RED".into(), role: None, id: None })
            .await;
        assert_eq!(reply.message, "Light status updated: RED");
        assert_eq!(reply.results.len(), 2);

        let mut calls = link.light_calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["road_light_north=RED", "road_light_south=RED"]);
    }

    #[tokio::test]
    async fn test_update_for_unknown_device() {
        let (c, _shutdown) = coordinator(Arc::new(RecordingLink::default()));
        let reply = c
            .update_light_status(UpdateLightStatusRequest {
                status: "GREEN".into(),
                role: Some("road_light".into()),
                id: Some("east".into()),
            })
            .await;
        assert_eq!(reply.message, "No registered device matches [road_light/east]");
    }

    #[tokio::test]
    async fn test_sensor_without_barrier() {
        let (c, _shutdown) = coordinator(Arc::new(RecordingLink::default()));
        let reply = c.trigger_sensor(TriggerSensorRequest { train_detected: true }, "sensor").await;
        assert_eq!(reply.message, "Train detected, but no barrier client connected.");

        register(&c, "train_barrier", None);
        let reply = c.trigger_sensor(TriggerSensorRequest { train_detected: true }, "sensor").await;
        assert_eq!(reply.message, "Train detected, barrier lowered.");
    }

    #[tokio::test]
    async fn test_control_barrier_does_not_move_interlock() {
        let (c, _shutdown) = coordinator(Arc::new(RecordingLink::default()));
        let reply = c.control_barrier(ControlBarrierRequest::lower());
        assert_eq!(reply.message, "The barrier is down.");
        assert_eq!(c.interlock().status().await.state, crate::domain::types::BarrierState::Up);
    }

    #[test]
    fn test_split_paired_status() {
        assert_eq!(split_paired_status("GREEN to RED"), Some(("GREEN", "RED")));
        assert_eq!(split_paired_status(" red to  green "), Some(("red", "green")));
        assert_eq!(split_paired_status("RED"), None);
        assert_eq!(split_paired_status("GREEN to "), None);
    }

    #[tokio::test]
    async fn test_paired_status_sends_each_light_its_own_colour() {
        let link = Arc::new(RecordingLink::default());
        let (c, _shutdown) = coordinator(link.clone());
        register(&c, "road_light_north", None);
        register(&c, "road_light_south", None);

        let reply = c
            .update_light_status(UpdateLightStatusRequest { status: "GREEN to RED".into(), role: None, id: None })
            .await;
        assert_eq!(reply.message, "Light status updated: GREEN to RED");
        assert_eq!(reply.results.len(), 2);
        assert_eq!(
            *link.light_calls.lock(),
            vec!["road_light_north=GREEN", "road_light_south=RED"]
        );

        let north = c.dispatcher.light_state(&DeviceKey::role_only("road_light_north")).unwrap();
        let south = c.dispatcher.light_state(&DeviceKey::role_only("road_light_south")).unwrap();
        assert_eq!(north.color, crate::domain::types::LightColor::Green);
        assert_eq!(south.color, crate::domain::types::LightColor::Red);
    }

    #[tokio::test]
    async fn test_paired_status_with_one_light_missing() {
        let link = Arc::new(RecordingLink::default());
        let (c, _shutdown) = coordinator(link.clone());
        register(&c, "road_light_north", None);

        let reply = c
            .update_light_status(UpdateLightStatusRequest { status: "RED to GREEN".into(), role: None, id: None })
            .await;
        assert_eq!(reply.message, "Light status updated: RED to GREEN");
        assert_eq!(*link.light_calls.lock(), vec!["road_light_north=RED"]);
    }
}
