//! Provisioning reconciliation state machine.
//!
//! [`Reconciler::handle`] consumes one [`Event`] and returns the [`Effect`]s
//! the caller must perform. It never touches the engine itself, so every
//! transition can be driven and inspected without hardware. Results of
//! engine calls come back as events stamped with the binding generation
//! that requested them; results from an older generation are dropped.

pub mod activation;

use crate::engine::{LocalAccount, ProvisioningStatus, VersionInfo};
use crate::error::EngineError;
use crate::notify::AgentMessage;
use crate::policy::{BadPasswordAction, Policy, PolicyType};
use crate::wsman::{ActivationInfo, CLIENT_CONTROL_MODE};
use activation::{activation_digest, generate_admin_password, AdminCredential, ADMIN_USER};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `unprovision` mode used to leave client control mode.
pub const UNPROVISION_CLIENT_MODE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unbound,
    Binding,
    Bound,
    OsAdminReady,
    Error,
}

impl EngineState {
    pub fn code(self) -> i32 {
        match self {
            EngineState::Unbound => 0,
            EngineState::Binding => 1,
            EngineState::Bound => 2,
            EngineState::OsAdminReady => 3,
            EngineState::Error => -1,
        }
    }
}

/// Notification listener state as reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Down,
    Connecting,
    Connected,
    Failed,
}

impl ListenerState {
    pub fn code(self) -> i32 {
        match self {
            ListenerState::Down => 0,
            ListenerState::Connecting => 1,
            ListenerState::Connected => 2,
            ListenerState::Failed => -1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub retry_limit: u32,
    pub rebind_delay: Duration,
    pub settle_delay: Duration,
    pub kvm_enabled: bool,
    pub kvm_min_major: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            rebind_delay: Duration::from_secs(10),
            settle_delay: Duration::from_secs(8),
            kvm_enabled: true,
            kvm_min_major: 12,
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Reset,
    VersionReported {
        generation: u64,
        version: Result<VersionInfo, EngineError>,
    },
    EngineFault {
        generation: u64,
    },
    ListenerChanged {
        generation: u64,
        state: ListenerState,
    },
    AccountFetched {
        generation: u64,
        account: Option<LocalAccount>,
    },
    SetPolicy(Policy),
    ApplyPolicy,
    ProvisioningRead {
        generation: u64,
        status: Result<ProvisioningStatus, EngineError>,
    },
    Unprovisioned {
        generation: u64,
        status: Result<u32, EngineError>,
    },
    ActivationInfoRead {
        generation: u64,
        info: Result<ActivationInfo, EngineError>,
    },
    SetupCompleted {
        generation: u64,
        result: Result<(), EngineError>,
    },
    PasswordProbed {
        generation: u64,
        result: Result<PasswordCheck, EngineError>,
    },
}

/// Answer to the stored admin password check. Transport failures are
/// reported as the `Err` side of the event instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordCheck {
    Accepted,
    Rejected { status: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StateChanged(EngineState),
    /// Drop the out-of-band client and cancel every pending timer.
    Teardown,
    Bind { generation: u64 },
    ScheduleRebind(Duration),
    ConnectListener { generation: u64 },
    FetchAccount { generation: u64 },
    ConnectOob(LocalAccount),
    StartKvm,
    ReadProvisioning { generation: u64 },
    Unprovision { generation: u64, mode: u32 },
    /// Fetch the local account, rebuild the client and enumerate activation
    /// settings.
    BeginActivation { generation: u64 },
    HostBasedSetup { generation: u64, mode: u32, digest: String },
    ProbePassword { generation: u64, credential: AdminCredential },
    PersistPassword(String),
    PersistPolicy(Policy),
    Report(AgentMessage),
    ScheduleApply(Duration),
}

pub struct Reconciler {
    config: ReconcileConfig,
    state: EngineState,
    listener: ListenerState,
    generation: u64,
    retries: u32,
    version: Option<VersionInfo>,
    policy: Option<Policy>,
    admin_password: Option<String>,
    pending_password: Option<String>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            state: EngineState::Unbound,
            listener: ListenerState::Down,
            generation: 0,
            retries: 0,
            version: None,
            policy: None,
            admin_password: None,
            pending_password: None,
        }
    }

    /// Seeds values loaded from persistent storage before the first reset.
    pub fn restore(&mut self, policy: Option<Policy>, admin_password: Option<String>) {
        self.policy = policy;
        self.admin_password = admin_password.filter(|p| !p.is_empty());
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    pub fn version(&self) -> Option<&VersionInfo> {
        self.version.as_ref()
    }

    pub fn has_admin_password(&self) -> bool {
        self.admin_password.is_some()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Reset => self.on_reset(),
            Event::VersionReported {
                generation,
                version,
            } => {
                if !self.accepts(generation, &[EngineState::Binding]) {
                    return vec![];
                }
                self.on_version(version)
            }
            Event::EngineFault { generation } => {
                if generation != self.generation || self.state == EngineState::Error {
                    return vec![];
                }
                warn!(generation, "management engine reported an error");
                self.state = EngineState::Error;
                vec![Effect::Teardown, Effect::StateChanged(EngineState::Error)]
            }
            Event::ListenerChanged { generation, state } => {
                if generation != self.generation {
                    return vec![];
                }
                self.listener = state;
                // The listener outcome does not gate the account setup.
                match (state, self.state) {
                    (ListenerState::Connected | ListenerState::Down, EngineState::Bound) => {
                        vec![Effect::FetchAccount { generation }]
                    }
                    _ => vec![],
                }
            }
            Event::AccountFetched {
                generation,
                account,
            } => {
                if !self.accepts(generation, &[EngineState::Bound]) {
                    return vec![];
                }
                self.on_account(account)
            }
            Event::SetPolicy(policy) => self.on_set_policy(policy),
            Event::ApplyPolicy => self.apply_policy(),
            Event::ProvisioningRead { generation, status } => {
                if !self.accepts(generation, &[EngineState::OsAdminReady]) {
                    return vec![];
                }
                self.on_provisioning(status)
            }
            Event::Unprovisioned { generation, status } => {
                if !self.accepts(generation, &[EngineState::OsAdminReady]) {
                    return vec![];
                }
                match status {
                    Ok(0) => {
                        info!("client control mode deactivated");
                        vec![
                            Effect::Report(AgentMessage::deactivated()),
                            Effect::ScheduleApply(self.config.settle_delay),
                        ]
                    }
                    Ok(code) => {
                        warn!(code, "client control mode deactivation failed");
                        vec![]
                    }
                    Err(err) => {
                        warn!(error = %err, "client control mode deactivation failed");
                        vec![]
                    }
                }
            }
            Event::ActivationInfoRead { generation, info } => {
                if !self.accepts(generation, &[EngineState::OsAdminReady]) {
                    return vec![];
                }
                self.on_activation_info(generation, info)
            }
            Event::SetupCompleted { generation, result } => {
                if !self.accepts(generation, &[EngineState::OsAdminReady]) {
                    return vec![];
                }
                self.on_setup(result)
            }
            Event::PasswordProbed { generation, result } => {
                if !self.accepts(generation, &[EngineState::OsAdminReady]) {
                    return vec![];
                }
                self.on_probe(generation, result)
            }
        }
    }

    fn accepts(&self, generation: u64, states: &[EngineState]) -> bool {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "dropping result from superseded binding attempt"
            );
            return false;
        }
        states.contains(&self.state)
    }

    fn on_reset(&mut self) -> Vec<Effect> {
        self.retries += 1;
        self.generation += 1;
        self.state = EngineState::Binding;
        self.listener = ListenerState::Down;
        self.version = None;
        self.pending_password = None;
        debug!(
            generation = self.generation,
            attempt = self.retries,
            "binding to management engine"
        );
        vec![
            Effect::Teardown,
            Effect::StateChanged(EngineState::Binding),
            Effect::Bind {
                generation: self.generation,
            },
        ]
    }

    fn on_version(&mut self, version: Result<VersionInfo, EngineError>) -> Vec<Effect> {
        match version {
            Ok(version) => {
                self.state = EngineState::Bound;
                self.retries = 0;
                self.version = Some(version);
                self.listener = ListenerState::Connecting;
                vec![
                    Effect::StateChanged(EngineState::Bound),
                    Effect::ConnectListener {
                        generation: self.generation,
                    },
                ]
            }
            Err(err) => {
                self.state = EngineState::Error;
                let mut effects = vec![Effect::StateChanged(EngineState::Error)];
                if self.retries < self.config.retry_limit {
                    warn!(error = %err, attempt = self.retries, "engine binding failed, retrying");
                    effects.push(Effect::ScheduleRebind(self.config.rebind_delay));
                } else {
                    warn!(
                        error = %err,
                        attempts = self.retries,
                        "engine binding failed, retry limit reached"
                    );
                }
                effects
            }
        }
    }

    fn on_account(&mut self, account: Option<LocalAccount>) -> Vec<Effect> {
        let Some(account) = account else {
            debug!("local system account unavailable, staying bound");
            return vec![];
        };
        self.state = EngineState::OsAdminReady;
        let mut effects = vec![
            Effect::ConnectOob(account),
            Effect::StateChanged(EngineState::OsAdminReady),
        ];
        effects.extend(self.apply_policy());
        if self.kvm_supported() {
            effects.push(Effect::StartKvm);
        }
        effects
    }

    fn kvm_supported(&self) -> bool {
        self.config.kvm_enabled
            && self
                .version
                .as_ref()
                .and_then(|v| v.amt_major())
                .map(|major| major >= self.config.kvm_min_major)
                .unwrap_or(false)
    }

    fn on_set_policy(&mut self, policy: Policy) -> Vec<Effect> {
        if self.policy.as_ref() == Some(&policy) {
            return vec![];
        }
        self.policy = Some(policy.clone());
        let mut effects = vec![Effect::PersistPolicy(policy)];
        effects.extend(self.apply_policy());
        effects
    }

    fn apply_policy(&mut self) -> Vec<Effect> {
        if self.state != EngineState::OsAdminReady {
            return vec![];
        }
        let Some(policy) = self.policy.as_ref() else {
            return vec![];
        };
        if policy.kind == PolicyType::None {
            return vec![];
        }
        if let Some(password) = policy.explicit_password() {
            self.admin_password = Some(password.to_string());
        }
        vec![Effect::ReadProvisioning {
            generation: self.generation,
        }]
    }

    fn on_provisioning(&mut self, status: Result<ProvisioningStatus, EngineError>) -> Vec<Effect> {
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "unable to read provisioning state");
                return vec![];
            }
        };
        let Some(policy) = self.policy.clone() else {
            return vec![];
        };
        let generation = self.generation;
        match (policy.kind, status) {
            (PolicyType::DeactivateClientMode, ProvisioningStatus::ClientControl) => {
                info!("deactivating client control mode");
                vec![Effect::Unprovision {
                    generation,
                    mode: UNPROVISION_CLIENT_MODE,
                }]
            }
            (PolicyType::ActivateClientMode, ProvisioningStatus::Unprovisioned) => {
                let password = policy
                    .explicit_password()
                    .map(|p| p.to_string())
                    .unwrap_or_else(generate_admin_password);
                self.pending_password = Some(password);
                info!("activating client control mode");
                vec![Effect::BeginActivation { generation }]
            }
            (PolicyType::ActivateClientMode, ProvisioningStatus::ClientControl) => {
                match self.admin_password.as_ref() {
                    Some(password) => vec![Effect::ProbePassword {
                        generation,
                        credential: AdminCredential::admin(password.clone()),
                    }],
                    None => vec![],
                }
            }
            (kind, status) => {
                debug!(?kind, ?status, "no remediation for policy and engine state");
                vec![]
            }
        }
    }

    fn on_activation_info(
        &mut self,
        generation: u64,
        info: Result<ActivationInfo, EngineError>,
    ) -> Vec<Effect> {
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                warn!(error = %err, "failed to fetch activation information");
                self.pending_password = None;
                return vec![];
            }
        };
        if !info.allows_client_control() {
            warn!(
                modes = ?info.allowed_control_modes,
                "client control mode activation not allowed"
            );
            self.pending_password = None;
            return vec![];
        }
        let Some(password) = self.pending_password.as_ref() else {
            return vec![];
        };
        vec![Effect::HostBasedSetup {
            generation,
            mode: CLIENT_CONTROL_MODE,
            digest: activation_digest(ADMIN_USER, &info.digest_realm, password),
        }]
    }

    fn on_setup(&mut self, result: Result<(), EngineError>) -> Vec<Effect> {
        let password = self.pending_password.take();
        if let Err(err) = result {
            warn!(error = %err, "client control mode activation failed");
            return vec![];
        }
        let Some(password) = password else {
            return vec![];
        };
        info!("client control mode activation succeeded");
        self.admin_password = Some(password.clone());
        vec![
            Effect::PersistPassword(password.clone()),
            Effect::Report(AgentMessage::activated(ADMIN_USER, &password)),
            Effect::ScheduleApply(self.config.settle_delay),
        ]
    }

    fn on_probe(&mut self, generation: u64, result: Result<PasswordCheck, EngineError>) -> Vec<Effect> {
        let status = match result {
            Ok(PasswordCheck::Accepted) => {
                debug!("stored admin password accepted");
                return vec![];
            }
            Ok(PasswordCheck::Rejected { status }) => status,
            Err(err) => {
                warn!(error = %err, "admin password check failed, leaving engine as is");
                return vec![];
            }
        };
        let reactivate = self
            .policy
            .as_ref()
            .map(|p| p.bad_password_action == BadPasswordAction::Reactivate)
            .unwrap_or(false);
        if reactivate {
            warn!(status, "stored admin password rejected, deactivating to reactivate");
            vec![Effect::Unprovision {
                generation,
                mode: UNPROVISION_CLIENT_MODE,
            }]
        } else {
            warn!(status, "stored admin password rejected");
            vec![]
        }
    }
}
