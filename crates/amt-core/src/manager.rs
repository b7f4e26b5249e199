//! Runtime around the [`Reconciler`]: performs its effects against the real
//! collaborators, feeds results back as events and owns the timers.

use crate::engine::{EngineBinding, EngineInfo, ProvisioningStatus};
use crate::error::EngineError;
use crate::kvm::{KvmTunnel, SignalReply};
use crate::notify::{
    describe_notification, AgentMessage, NotificationChannel, NotificationEvent, Notifier,
    KVM_DATA_READY_CODE,
};
use crate::policy::Policy;
use crate::reconcile::activation::AdminCredential;
use crate::reconcile::{
    Effect, EngineState, Event, ListenerState, PasswordCheck, ReconcileConfig, Reconciler,
};
use crate::store::{KeyValueStore, CCM_PASSWORD_KEY, POLICY_KEY};
use crate::timer::{TimerKind, TimerQueue};
use crate::wsman::{
    encode_payload, ActivationInfo, OobClient, OobClientFactory, OobEndpoint, DEFAULT_OOB_HOST,
    DEFAULT_OOB_PORT, GENERAL_SETTINGS_CLASS, HOST_BASED_SETUP_CLASS, STATUS_OK,
};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PROVISIONED_STATE: u32 = 2;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconcile: ReconcileConfig,
    pub oob_host: String,
    pub oob_port: u16,
    pub kvm_poll: Duration,
    /// Mirror diagnostic lines to the parent agent console.
    pub debug: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconcile: ReconcileConfig::default(),
            oob_host: DEFAULT_OOB_HOST.to_string(),
            oob_port: DEFAULT_OOB_PORT,
            kvm_poll: Duration::from_secs(2),
            debug: false,
        }
    }
}

/// Everything the manager talks to.
pub struct Collaborators {
    pub engine: Box<dyn EngineBinding>,
    pub listener: Box<dyn NotificationChannel>,
    pub oob: Box<dyn OobClientFactory>,
    pub store: Box<dyn KeyValueStore>,
    pub notifier: Box<dyn Notifier>,
}

type StateHook = Box<dyn FnMut(EngineState)>;

pub struct AmtManager {
    config: ManagerConfig,
    reconciler: Reconciler,
    engine: Box<dyn EngineBinding>,
    listener: Box<dyn NotificationChannel>,
    oob_factory: Box<dyn OobClientFactory>,
    oob: Option<Box<dyn OobClient>>,
    store: Box<dyn KeyValueStore>,
    notifier: Box<dyn Notifier>,
    tunnel: Option<KvmTunnel>,
    kvm_active: bool,
    timers: TimerQueue,
    queue: VecDeque<Event>,
    state_hook: Option<StateHook>,
}

impl AmtManager {
    pub fn new(config: ManagerConfig, deps: Collaborators) -> Self {
        Self {
            reconciler: Reconciler::new(config.reconcile.clone()),
            config,
            engine: deps.engine,
            listener: deps.listener,
            oob_factory: deps.oob,
            oob: None,
            store: deps.store,
            notifier: deps.notifier,
            tunnel: None,
            kvm_active: false,
            timers: TimerQueue::new(),
            queue: VecDeque::new(),
            state_hook: None,
        }
    }

    pub fn with_tunnel(mut self, tunnel: KvmTunnel) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    pub fn on_state_change(&mut self, hook: impl FnMut(EngineState) + 'static) {
        self.state_hook = Some(Box::new(hook));
    }

    pub fn state(&self) -> EngineState {
        self.reconciler.state()
    }

    pub fn listener_state(&self) -> ListenerState {
        self.reconciler.listener_state()
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.reconciler.policy()
    }

    pub fn generation(&self) -> u64 {
        self.reconciler.generation()
    }

    pub fn kvm_active(&self) -> bool {
        self.kvm_active
    }

    pub fn tunnel_mut(&mut self) -> Option<&mut KvmTunnel> {
        self.tunnel.as_mut()
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Loads persisted policy and password, then binds.
    pub fn start(&mut self) {
        let policy = self
            .store
            .get(POLICY_KEY)
            .and_then(|raw| match Policy::from_json(&raw) {
                Ok(policy) => Some(policy),
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable stored policy");
                    None
                }
            });
        let password = self.store.get(CCM_PASSWORD_KEY);
        self.reconciler.restore(policy, password);
        self.reset();
    }

    pub fn reset(&mut self) {
        self.dispatch(Event::Reset);
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.dispatch(Event::SetPolicy(policy));
    }

    /// Engine details, or `None` until the engine is bound.
    pub fn get_info(&mut self) -> Option<EngineInfo> {
        match self.reconciler.state() {
            EngineState::Bound | EngineState::OsAdminReady => {
                Some(EngineInfo::collect(self.engine.as_mut()))
            }
            _ => None,
        }
    }

    /// Asynchronous error raised by the engine driver.
    pub fn on_engine_error(&mut self) {
        let generation = self.reconciler.generation();
        self.dispatch(Event::EngineFault { generation });
    }

    pub fn on_notification(&mut self, event: NotificationEvent) {
        let generation = self.reconciler.generation();
        match event {
            NotificationEvent::Connected => {
                self.console("notification listener connected");
                self.dispatch(Event::ListenerChanged {
                    generation,
                    state: ListenerState::Connected,
                });
            }
            NotificationEvent::Error(message) => {
                self.console(&format!("notification listener error: {}", message));
                self.dispatch(Event::ListenerChanged {
                    generation,
                    state: ListenerState::Down,
                });
            }
            NotificationEvent::Notify { data, code, .. } => {
                if code.as_deref() == Some(KVM_DATA_READY_CODE) {
                    self.kvm_get_data(false);
                    return;
                }
                if let Some(text) = data.as_ref().and_then(describe_notification) {
                    self.notifier.send_command(&AgentMessage::notify(text));
                }
            }
        }
    }

    /// Runs every timer due at `now`.
    pub fn fire_due_timers(&mut self, now: Instant) {
        for kind in self.timers.take_due(now) {
            match kind {
                TimerKind::Rebind => self.dispatch(Event::Reset),
                TimerKind::ApplyPolicy => self.dispatch(Event::ApplyPolicy),
                TimerKind::KvmPoll => {
                    if self.kvm_active {
                        self.kvm_get_data(false);
                        self.timers.arm(TimerKind::KvmPoll, now, self.config.kvm_poll);
                    }
                }
            }
        }
    }

    /// Reads one message from the engine's KVM data channel and answers it.
    /// With `skip` set the message is read and dropped.
    pub fn kvm_get_data(&mut self, skip: bool) {
        let Some(oob) = self.oob.as_mut() else {
            return;
        };
        let read = match oob.data_channel_read() {
            Ok(read) => read,
            Err(e) => {
                debug!(error = %e, "kvm data channel read failed");
                return;
            }
        };
        if skip {
            return;
        }
        let Some(text) = read.text() else {
            return;
        };
        let Some(tunnel) = self.tunnel.as_mut() else {
            debug!("no tunnel configured, dropping kvm signaling");
            return;
        };
        if let Some(reply) = tunnel.handle_signal(&text) {
            self.send_signal(&reply);
        }
    }

    pub fn kvm_set_data(&mut self, json: &str) {
        let Some(oob) = self.oob.as_mut() else {
            return;
        };
        if let Err(e) = oob.data_channel_write(&encode_payload(json)) {
            warn!(error = %e, "kvm data channel write failed");
        }
    }

    fn send_signal(&mut self, reply: &SignalReply) {
        match reply.to_json() {
            Ok(json) => self.kvm_set_data(&json),
            Err(e) => warn!(error = %e, "failed to encode signaling reply"),
        }
    }

    fn dispatch(&mut self, event: Event) {
        self.queue.push_back(event);
        while let Some(event) = self.queue.pop_front() {
            for effect in self.reconciler.handle(event) {
                self.perform(effect);
            }
        }
    }

    fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::StateChanged(state) => {
                self.console(&format!("engine state {}", state.code()));
                if let Some(hook) = self.state_hook.as_mut() {
                    hook(state);
                }
            }
            Effect::Teardown => {
                self.oob = None;
                self.kvm_active = false;
                self.timers.clear();
            }
            Effect::Bind { generation } => {
                let version = self
                    .engine
                    .bind()
                    .and_then(|_| self.engine.get_version());
                self.queue
                    .push_back(Event::VersionReported { generation, version });
            }
            Effect::ScheduleRebind(delay) => {
                self.timers.arm(TimerKind::Rebind, Instant::now(), delay);
            }
            Effect::ConnectListener { generation } => {
                if let Err(e) = self.listener.connect() {
                    warn!(error = %e, "notification listener failed to start");
                    self.queue.push_back(Event::ListenerChanged {
                        generation,
                        state: ListenerState::Failed,
                    });
                }
            }
            Effect::FetchAccount { generation } => {
                let account = match self.engine.get_local_system_account() {
                    Ok(account) => Some(account),
                    Err(e) => {
                        debug!(error = %e, "local system account unavailable");
                        None
                    }
                };
                self.queue
                    .push_back(Event::AccountFetched { generation, account });
            }
            Effect::ConnectOob(account) => {
                let endpoint = self.endpoint(account.user, account.pass);
                self.oob = self.connect_oob(&endpoint);
            }
            Effect::StartKvm => {
                self.console("kvm data channel setup");
                self.kvm_get_data(true);
                self.kvm_active = true;
                self.timers
                    .arm(TimerKind::KvmPoll, Instant::now(), self.config.kvm_poll);
                self.send_signal(&SignalReply::restart());
            }
            Effect::ReadProvisioning { generation } => {
                let status = self.read_provisioning();
                self.queue
                    .push_back(Event::ProvisioningRead { generation, status });
            }
            Effect::Unprovision { generation, mode } => {
                let status = self.engine.unprovision(mode);
                self.queue
                    .push_back(Event::Unprovisioned { generation, status });
            }
            Effect::BeginActivation { generation } => {
                let info = self.begin_activation();
                self.queue
                    .push_back(Event::ActivationInfoRead { generation, info });
            }
            Effect::HostBasedSetup {
                generation,
                mode,
                digest,
            } => {
                let result = match self.oob.as_mut() {
                    Some(oob) => oob
                        .host_based_setup(mode, &digest)
                        .and_then(|r| r.into_result()),
                    None => Err(EngineError::NotReady),
                };
                self.queue
                    .push_back(Event::SetupCompleted { generation, result });
            }
            Effect::ProbePassword {
                generation,
                credential,
            } => {
                let result = self.probe_password(credential);
                self.queue
                    .push_back(Event::PasswordProbed { generation, result });
            }
            Effect::PersistPassword(password) => {
                if let Err(e) = self.store.put(CCM_PASSWORD_KEY, &password) {
                    warn!(error = %e, "failed to persist admin password");
                }
            }
            Effect::PersistPolicy(policy) => {
                let result = serde_json::to_string(&policy)
                    .map_err(crate::error::StoreError::from)
                    .and_then(|raw| self.store.put(POLICY_KEY, &raw));
                if let Err(e) = result {
                    warn!(error = %e, "failed to persist policy");
                }
            }
            Effect::Report(message) => self.notifier.send_command(&message),
            Effect::ScheduleApply(delay) => {
                self.timers
                    .arm(TimerKind::ApplyPolicy, Instant::now(), delay);
            }
        }
    }

    fn endpoint(&self, user: String, pass: String) -> OobEndpoint {
        OobEndpoint {
            host: self.config.oob_host.clone(),
            port: self.config.oob_port,
            user,
            pass,
            tls: false,
        }
    }

    fn connect_oob(&mut self, endpoint: &OobEndpoint) -> Option<Box<dyn OobClient>> {
        match self.oob_factory.connect(endpoint) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(?endpoint, error = %e, "unable to build management client");
                None
            }
        }
    }

    fn read_provisioning(&mut self) -> Result<ProvisioningStatus, EngineError> {
        let state = self.engine.get_provisioning_state()?;
        let control_mode = if state == PROVISIONED_STATE {
            self.engine.get_control_mode().ok()
        } else {
            None
        };
        Ok(ProvisioningStatus::from_raw(state, control_mode))
    }

    /// Rebuilds the client from a freshly fetched local account and reads
    /// the activation settings.
    fn begin_activation(&mut self) -> Result<ActivationInfo, EngineError> {
        let account = self.engine.get_local_system_account()?;
        let endpoint = self.endpoint(account.user, account.pass);
        let mut client = self.oob_factory.connect(&endpoint)?;
        let batch = client.batch_enumerate(&[GENERAL_SETTINGS_CLASS, HOST_BASED_SETUP_CLASS]);
        self.oob = Some(client);
        ActivationInfo::from_batch(&batch?)
    }

    /// Only a non-200 answer counts as a rejection; failing to reach the
    /// engine is returned as an error.
    fn probe_password(&mut self, credential: AdminCredential) -> Result<PasswordCheck, EngineError> {
        let endpoint = self.endpoint(credential.username, credential.password);
        let mut client = self.oob_factory.connect(&endpoint)?;
        let batch = client.batch_enumerate(&[GENERAL_SETTINGS_CLASS])?;
        if batch.status != STATUS_OK {
            return Ok(PasswordCheck::Rejected {
                status: batch.status,
            });
        }
        Ok(PasswordCheck::Accepted)
    }

    fn console(&mut self, text: &str) {
        debug!("{}", text);
        if self.config.debug {
            self.notifier
                .send_command(&AgentMessage::console(format!("amt-manager: {}", text)));
        }
    }
}
