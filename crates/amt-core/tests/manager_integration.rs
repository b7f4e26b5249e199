use amt_core::engine::{
    ComponentVersion, EngineBinding, LanInterface, LocalAccount, VersionInfo, AMT_COMPONENT,
    FLAG_CCM, FLAG_EHBC,
};
use amt_core::kvm::files::LocalFiles;
use amt_core::kvm::peer::{PeerConnection, PeerConnector, ScreenSource, ScreenStream};
use amt_core::kvm::platform::{Platform, WorkstationLocker};
use amt_core::kvm::KvmTunnel;
use amt_core::notify::{AgentMessage, NotificationChannel, NotificationEvent, Notifier};
use amt_core::store::{KeyValueStore, MemoryStore, CCM_PASSWORD_KEY, POLICY_KEY};
use amt_core::timer::TimerKind;
use amt_core::wsman::{
    encode_payload, BatchResponse, DataChannelRead, OobClient, OobClientFactory, OobEndpoint,
    SetupResult, GENERAL_SETTINGS_CLASS, HOST_BASED_SETUP_CLASS,
};
use amt_core::{
    activation_digest, AmtManager, Collaborators, EngineError, EngineState, ListenerState,
    ManagerConfig, Policy, PolicyType, StoreError, TunnelError,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct EngineFixture {
    amt_version: String,
    fail_binds: u32,
    provisioning_state: u32,
    control_mode: u32,
    account: Option<LocalAccount>,
    unprovision_status: u32,
    binds: u32,
    unprovision_calls: Vec<u32>,
    provisioning_reads: u32,
}

impl Default for EngineFixture {
    fn default() -> Self {
        Self {
            amt_version: "11.8.50".to_string(),
            fail_binds: 0,
            provisioning_state: 0,
            control_mode: 0,
            account: Some(LocalAccount {
                user: "$$OsAdmin".to_string(),
                pass: "os-secret".to_string(),
            }),
            unprovision_status: 0,
            binds: 0,
            unprovision_calls: Vec::new(),
            provisioning_reads: 0,
        }
    }
}

#[derive(Clone, Default)]
struct MockEngine {
    state: Arc<Mutex<EngineFixture>>,
}

impl EngineBinding for MockEngine {
    fn bind(&mut self) -> Result<(), EngineError> {
        self.state.lock().unwrap().binds += 1;
        Ok(())
    }

    fn get_protocol_version(&mut self) -> Result<String, EngineError> {
        Ok("1.0.0".to_string())
    }

    fn get_version(&mut self) -> Result<VersionInfo, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_binds > 0 {
            state.fail_binds -= 1;
            return Err(EngineError::NotReady);
        }
        Ok(VersionInfo {
            components: vec![ComponentVersion {
                description: AMT_COMPONENT.to_string(),
                version: state.amt_version.clone(),
            }],
        })
    }

    fn get_provisioning_mode(&mut self) -> Result<u32, EngineError> {
        Ok(1)
    }

    fn get_provisioning_state(&mut self) -> Result<u32, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.provisioning_reads += 1;
        Ok(state.provisioning_state)
    }

    fn get_ehbc_state(&mut self) -> Result<bool, EngineError> {
        Ok(true)
    }

    fn get_control_mode(&mut self) -> Result<u32, EngineError> {
        Ok(self.state.lock().unwrap().control_mode)
    }

    fn get_lan_interface_settings(&mut self, index: u32) -> Result<LanInterface, EngineError> {
        if index == 0 {
            Ok(LanInterface {
                interface_index: 0,
                mac_address: Some("00:11:22:33:44:55".to_string()),
                ..LanInterface::default()
            })
        } else {
            Err(EngineError::Driver("no such interface".to_string()))
        }
    }

    fn get_uuid(&mut self) -> Result<String, EngineError> {
        Ok("uuid-1".to_string())
    }

    fn get_dns_suffix(&mut self) -> Result<String, EngineError> {
        Err(EngineError::Driver("unset".to_string()))
    }

    fn get_local_system_account(&mut self) -> Result<LocalAccount, EngineError> {
        self.state
            .lock()
            .unwrap()
            .account
            .clone()
            .ok_or_else(|| EngineError::Driver("no account".to_string()))
    }

    fn unprovision(&mut self, mode: u32) -> Result<u32, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.unprovision_calls.push(mode);
        Ok(state.unprovision_status)
    }
}

#[derive(Default)]
struct OobLog {
    endpoints: Vec<OobEndpoint>,
    setups: Vec<(u32, String)>,
    reads: VecDeque<DataChannelRead>,
    read_calls: u32,
    writes: Vec<String>,
    allowed_modes: Value,
    admin_password: Option<String>,
    refuse_connect: bool,
}

#[derive(Clone)]
struct MockOobFactory {
    log: Arc<Mutex<OobLog>>,
}

struct MockOobClient {
    endpoint: OobEndpoint,
    log: Arc<Mutex<OobLog>>,
}

impl OobClientFactory for MockOobFactory {
    fn connect(&mut self, endpoint: &OobEndpoint) -> Result<Box<dyn OobClient>, EngineError> {
        let mut log = self.log.lock().unwrap();
        if log.refuse_connect {
            return Err(EngineError::Driver("connection refused".to_string()));
        }
        log.endpoints.push(endpoint.clone());
        Ok(Box::new(MockOobClient {
            endpoint: endpoint.clone(),
            log: self.log.clone(),
        }))
    }
}

impl OobClient for MockOobClient {
    fn batch_enumerate(&mut self, _class_names: &[&str]) -> Result<BatchResponse, EngineError> {
        let log = self.log.lock().unwrap();
        if self.endpoint.user == "admin"
            && log.admin_password.as_deref() != Some(self.endpoint.pass.as_str())
        {
            return Ok(BatchResponse {
                status: 401,
                items: BTreeMap::new(),
            });
        }
        let mut items = BTreeMap::new();
        items.insert(
            GENERAL_SETTINGS_CLASS.to_string(),
            json!({ "DigestRealm": "R" }),
        );
        items.insert(
            HOST_BASED_SETUP_CLASS.to_string(),
            json!({ "AllowedControlModes": log.allowed_modes.clone() }),
        );
        Ok(BatchResponse { status: 200, items })
    }

    fn host_based_setup(&mut self, mode: u32, digest: &str) -> Result<SetupResult, EngineError> {
        self.log
            .lock()
            .unwrap()
            .setups
            .push((mode, digest.to_string()));
        Ok(SetupResult {
            status: 200,
            return_value: 0,
            return_value_str: "SUCCESS".to_string(),
        })
    }

    fn data_channel_read(&mut self) -> Result<DataChannelRead, EngineError> {
        let mut log = self.log.lock().unwrap();
        log.read_calls += 1;
        Ok(log.reads.pop_front().unwrap_or(DataChannelRead {
            status: 200,
            return_value: 1,
            ..DataChannelRead::default()
        }))
    }

    fn data_channel_write(&mut self, payload: &str) -> Result<(), EngineError> {
        let text = String::from_utf8(B64.decode(payload).unwrap()).unwrap();
        self.log.lock().unwrap().writes.push(text);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedStore {
    inner: Arc<Mutex<MemoryStore>>,
}

impl KeyValueStore for SharedStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().put(key, value)
    }
}

#[derive(Clone, Default)]
struct MockNotifier {
    sent: Arc<Mutex<Vec<AgentMessage>>>,
}

impl Notifier for MockNotifier {
    fn send_command(&mut self, message: &AgentMessage) {
        self.sent.lock().unwrap().push(message.clone());
    }
}

#[derive(Clone, Default)]
struct MockListener {
    connects: Arc<Mutex<u32>>,
}

impl NotificationChannel for MockListener {
    fn connect(&mut self) -> Result<(), EngineError> {
        *self.connects.lock().unwrap() += 1;
        Ok(())
    }
}

struct NoPeer;

impl PeerConnector for NoPeer {
    fn create_connection(&mut self) -> Result<Box<dyn PeerConnection>, TunnelError> {
        Err(TunnelError::Peer("unavailable".to_string()))
    }
}

impl ScreenSource for NoPeer {
    fn open_stream(&mut self) -> Result<Box<dyn ScreenStream>, TunnelError> {
        Err(TunnelError::Peer("unavailable".to_string()))
    }
}

struct TestContext {
    manager: AmtManager,
    engine: MockEngine,
    oob: Arc<Mutex<OobLog>>,
    store: SharedStore,
    notifier: MockNotifier,
    listener: MockListener,
    states: Arc<Mutex<Vec<EngineState>>>,
}

fn setup(configure: impl FnOnce(&mut EngineFixture)) -> TestContext {
    setup_with_store(configure, SharedStore::default())
}

fn setup_with_store(configure: impl FnOnce(&mut EngineFixture), store: SharedStore) -> TestContext {
    let engine = MockEngine::default();
    {
        let mut fixture = engine.state.lock().unwrap();
        configure(&mut *fixture);
    }
    let oob = Arc::new(Mutex::new(OobLog {
        allowed_modes: json!([1, 2]),
        ..OobLog::default()
    }));
    let notifier = MockNotifier::default();
    let listener = MockListener::default();
    let deps = Collaborators {
        engine: Box::new(engine.clone()),
        listener: Box::new(listener.clone()),
        oob: Box::new(MockOobFactory { log: oob.clone() }),
        store: Box::new(store.clone()),
        notifier: Box::new(notifier.clone()),
    };
    let tunnel = KvmTunnel::new(
        Platform::Linux,
        Box::new(NoPeer),
        Box::new(NoPeer),
        LocalFiles::new(),
        Rc::new(WorkstationLocker),
    );
    let mut manager = AmtManager::new(ManagerConfig::default(), deps).with_tunnel(tunnel);
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();
    manager.on_state_change(move |state| seen.lock().unwrap().push(state));
    TestContext {
        manager,
        engine,
        oob,
        store,
        notifier,
        listener,
        states,
    }
}

impl TestContext {
    fn ready(&mut self) {
        self.manager.start();
        self.manager.on_notification(NotificationEvent::Connected);
        assert_eq!(self.manager.state(), EngineState::OsAdminReady);
    }

    fn later(&self, secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }

    fn messages(&self) -> Vec<AgentMessage> {
        self.notifier.sent.lock().unwrap().clone()
    }
}

#[test]
fn binding_gives_up_after_ten_attempts() {
    let mut ctx = setup(|e| e.fail_binds = u32::MAX);
    ctx.manager.start();
    let mut rounds = 0;
    while ctx.manager.is_timer_armed(TimerKind::Rebind) {
        ctx.manager.fire_due_timers(ctx.later(11));
        rounds += 1;
        assert!(rounds < 50, "rebind never stopped");
    }
    assert_eq!(ctx.engine.state.lock().unwrap().binds, 10);
    assert_eq!(ctx.manager.state(), EngineState::Error);
    assert_eq!(ctx.manager.next_deadline(), None);
}

#[test]
fn rebind_recovers_after_transient_failure() {
    let mut ctx = setup(|e| e.fail_binds = 2);
    ctx.manager.start();
    assert_eq!(ctx.manager.state(), EngineState::Error);
    ctx.manager.fire_due_timers(ctx.later(11));
    ctx.manager.fire_due_timers(ctx.later(11));
    assert_eq!(ctx.manager.state(), EngineState::Bound);
    assert_eq!(ctx.manager.listener_state(), ListenerState::Connecting);
    assert_eq!(*ctx.listener.connects.lock().unwrap(), 1);
    assert_eq!(
        ctx.states.lock().unwrap().as_slice(),
        &[
            EngineState::Binding,
            EngineState::Error,
            EngineState::Binding,
            EngineState::Error,
            EngineState::Binding,
            EngineState::Bound,
        ]
    );
}

#[test]
fn listener_error_still_sets_up_os_admin() {
    let mut ctx = setup(|_| {});
    ctx.manager.start();
    ctx.manager
        .on_notification(NotificationEvent::Error("refused".to_string()));
    assert_eq!(ctx.manager.state(), EngineState::OsAdminReady);
    assert_eq!(ctx.manager.listener_state(), ListenerState::Down);
    let endpoint = ctx.oob.lock().unwrap().endpoints[0].clone();
    assert_eq!(endpoint.user, "$$OsAdmin");
    assert_eq!(endpoint.port, 16992);
}

#[test]
fn activation_persists_password_and_reports() {
    let mut ctx = setup(|_| {});
    ctx.ready();
    ctx.manager.set_policy(
        Policy::new(PolicyType::ActivateClientMode).with_password("Secret1!"),
    );

    let setups = ctx.oob.lock().unwrap().setups.clone();
    assert_eq!(setups, vec![(2, activation_digest("admin", "R", "Secret1!"))]);
    assert_eq!(
        ctx.store.get(CCM_PASSWORD_KEY).as_deref(),
        Some("Secret1!")
    );
    let stored: Policy = serde_json::from_str(&ctx.store.get(POLICY_KEY).unwrap()).unwrap();
    assert_eq!(stored.kind, PolicyType::ActivateClientMode);
    assert!(ctx
        .messages()
        .contains(&AgentMessage::activated("admin", "Secret1!")));
    assert!(ctx.manager.is_timer_armed(TimerKind::ApplyPolicy));
}

#[test]
fn activation_without_password_generates_one() {
    let mut ctx = setup(|_| {});
    ctx.ready();
    ctx.manager
        .set_policy(Policy::new(PolicyType::ActivateClientMode));
    let stored = ctx.store.get(CCM_PASSWORD_KEY).unwrap();
    assert!(stored.starts_with("P@0s"));
    assert_eq!(stored.len(), 27);
    let setups = ctx.oob.lock().unwrap().setups.clone();
    assert_eq!(setups[0].1, activation_digest("admin", "R", &stored));
}

#[test]
fn activation_refused_when_client_mode_not_offered() {
    let mut ctx = setup(|_| {});
    ctx.oob.lock().unwrap().allowed_modes = json!([1]);
    ctx.ready();
    ctx.manager
        .set_policy(Policy::new(PolicyType::ActivateClientMode));
    assert!(ctx.oob.lock().unwrap().setups.is_empty());
    assert_eq!(ctx.store.get(CCM_PASSWORD_KEY), None);
    assert!(!ctx.manager.is_timer_armed(TimerKind::ApplyPolicy));
}

#[test]
fn equal_policy_issues_no_engine_commands() {
    let mut ctx = setup(|e| {
        e.provisioning_state = 2;
        e.control_mode = 1;
    });
    ctx.ready();
    ctx.manager
        .set_policy(Policy::new(PolicyType::DeactivateClientMode));
    assert_eq!(ctx.engine.state.lock().unwrap().provisioning_reads, 1);
    assert_eq!(ctx.engine.state.lock().unwrap().unprovision_calls, vec![1]);

    let again: Policy = serde_json::from_value(json!({"type": 1})).unwrap();
    ctx.manager.set_policy(again);
    assert_eq!(ctx.engine.state.lock().unwrap().provisioning_reads, 1);
    assert_eq!(ctx.engine.state.lock().unwrap().unprovision_calls, vec![1]);
}

#[test]
fn stored_policy_is_applied_on_start() {
    let store = SharedStore::default();
    store
        .inner
        .lock()
        .unwrap()
        .put(POLICY_KEY, r#"{"type":1}"#)
        .unwrap();
    let mut ctx = setup_with_store(
        |e| {
            e.provisioning_state = 2;
            e.control_mode = 1;
        },
        store,
    );
    ctx.ready();
    assert_eq!(ctx.engine.state.lock().unwrap().unprovision_calls, vec![1]);
    assert!(ctx.messages().contains(&AgentMessage::deactivated()));

    // The settle pass re-reads the engine and finds nothing left to do.
    ctx.engine.state.lock().unwrap().provisioning_state = 0;
    ctx.manager.fire_due_timers(ctx.later(9));
    assert_eq!(ctx.engine.state.lock().unwrap().provisioning_reads, 2);
    assert_eq!(ctx.engine.state.lock().unwrap().unprovision_calls, vec![1]);
}

#[test]
fn bad_stored_password_reactivates_when_asked() {
    let store = SharedStore::default();
    store
        .inner
        .lock()
        .unwrap()
        .put(CCM_PASSWORD_KEY, "Stale1!")
        .unwrap();
    let mut ctx = setup_with_store(
        |e| {
            e.provisioning_state = 2;
            e.control_mode = 1;
        },
        store,
    );
    ctx.oob.lock().unwrap().admin_password = Some("Current1!".to_string());
    ctx.ready();
    let policy: Policy = serde_json::from_value(json!({"type": 2, "badpass": 1})).unwrap();
    ctx.manager.set_policy(policy);
    assert_eq!(ctx.engine.state.lock().unwrap().unprovision_calls, vec![1]);
}

#[test]
fn accepted_stored_password_changes_nothing() {
    let store = SharedStore::default();
    store
        .inner
        .lock()
        .unwrap()
        .put(CCM_PASSWORD_KEY, "Current1!")
        .unwrap();
    let mut ctx = setup_with_store(
        |e| {
            e.provisioning_state = 2;
            e.control_mode = 1;
        },
        store,
    );
    ctx.oob.lock().unwrap().admin_password = Some("Current1!".to_string());
    ctx.ready();
    let policy: Policy = serde_json::from_value(json!({"type": 2, "badpass": 1})).unwrap();
    ctx.manager.set_policy(policy);
    assert!(ctx.engine.state.lock().unwrap().unprovision_calls.is_empty());
}

#[test]
fn unreachable_engine_during_password_check_keeps_activation() {
    let store = SharedStore::default();
    store
        .inner
        .lock()
        .unwrap()
        .put(CCM_PASSWORD_KEY, "Current1!")
        .unwrap();
    let mut ctx = setup_with_store(
        |e| {
            e.provisioning_state = 2;
            e.control_mode = 1;
        },
        store,
    );
    ctx.ready();
    ctx.oob.lock().unwrap().refuse_connect = true;
    let policy: Policy = serde_json::from_value(json!({"type": 2, "badpass": 1})).unwrap();
    ctx.manager.set_policy(policy);
    assert!(ctx.engine.state.lock().unwrap().unprovision_calls.is_empty());
    assert_eq!(ctx.manager.state(), EngineState::OsAdminReady);
}

#[test]
fn failed_activation_connect_keeps_kvm_polling() {
    let mut ctx = setup(|e| e.amt_version = "12.0.45".to_string());
    ctx.ready();
    assert!(ctx.manager.kvm_active());
    ctx.oob.lock().unwrap().refuse_connect = true;
    ctx.manager
        .set_policy(Policy::new(PolicyType::ActivateClientMode));
    assert!(ctx.oob.lock().unwrap().setups.is_empty());
    let before = ctx.oob.lock().unwrap().read_calls;
    ctx.manager.fire_due_timers(ctx.later(3));
    assert_eq!(ctx.oob.lock().unwrap().read_calls, before + 1);
}

#[test]
fn kvm_starts_on_recent_firmware_and_answers_present() {
    let mut ctx = setup(|e| e.amt_version = "12.0.45".to_string());
    ctx.oob.lock().unwrap().reads.push_back(DataChannelRead {
        status: 200,
        data_message: encode_payload(r#"{"action":"present"}"#),
        ..DataChannelRead::default()
    });
    ctx.ready();
    assert!(ctx.manager.kvm_active());
    {
        let log = ctx.oob.lock().unwrap();
        // The startup read is discarded.
        assert_eq!(log.read_calls, 1);
        assert!(log.reads.is_empty());
        assert_eq!(log.writes, vec![r#"{"action":"restart","ver":1}"#.to_string()]);
    }

    ctx.oob.lock().unwrap().reads.push_back(DataChannelRead {
        status: 200,
        data_message: encode_payload(r#"{"action":"present"}"#),
        ..DataChannelRead::default()
    });
    ctx.manager.fire_due_timers(ctx.later(3));
    let writes = ctx.oob.lock().unwrap().writes.clone();
    let reply: Value = serde_json::from_str(&writes[1]).unwrap();
    assert_eq!(reply, json!({"action": "present", "ver": 1, "platform": "linux"}));
    assert!(ctx.manager.is_timer_armed(TimerKind::KvmPoll));
}

#[test]
fn kvm_stays_off_on_old_firmware() {
    let mut ctx = setup(|_| {});
    ctx.ready();
    assert!(!ctx.manager.kvm_active());
    assert!(!ctx.manager.is_timer_armed(TimerKind::KvmPoll));
    assert_eq!(ctx.oob.lock().unwrap().read_calls, 0);
}

#[test]
fn kvm_data_ready_notification_triggers_read() {
    let mut ctx = setup(|e| e.amt_version = "14.1.0".to_string());
    ctx.ready();
    let before = ctx.oob.lock().unwrap().read_calls;
    ctx.manager.on_notification(NotificationEvent::Notify {
        data: None,
        text: None,
        code: Some("iAMT0052-3".to_string()),
    });
    assert_eq!(ctx.oob.lock().unwrap().read_calls, before + 1);
}

#[test]
fn user_notifications_are_relayed() {
    let mut ctx = setup(|_| {});
    ctx.ready();
    ctx.manager.on_notification(NotificationEvent::Notify {
        data: Some(json!({"Body": {"MessageID": "iAMT0052", "MessageArguments": ["1"]}})),
        text: None,
        code: Some("iAMT0052-1".to_string()),
    });
    ctx.manager.on_notification(NotificationEvent::Notify {
        data: Some(json!({"Body": {"MessageID": "iAMT9999", "MessageArguments": ["1"]}})),
        text: None,
        code: None,
    });
    let notes: Vec<AgentMessage> = ctx
        .messages()
        .into_iter()
        .filter(|m| matches!(m, AgentMessage::Msg { .. }))
        .collect();
    assert_eq!(notes, vec![AgentMessage::notify("Intel&reg; AMT KVM connected")]);
}

#[test]
fn get_info_requires_binding() {
    let mut ctx = setup(|e| e.fail_binds = 1);
    ctx.manager.start();
    assert_eq!(ctx.manager.get_info(), None);
    ctx.manager.fire_due_timers(ctx.later(11));
    let info = ctx.manager.get_info().unwrap();
    assert_eq!(info.flags, FLAG_EHBC);
    assert_eq!(info.uuid.as_deref(), Some("uuid-1"));
    assert!(info.net0.is_some());
    assert!(info.net1.is_none());
    assert!(info.dns.is_none());

    ctx.engine.state.lock().unwrap().control_mode = 1;
    assert_eq!(ctx.manager.get_info().unwrap().flags, FLAG_EHBC + FLAG_CCM);
}

#[test]
fn engine_error_stops_without_retry() {
    let mut ctx = setup(|_| {});
    ctx.ready();
    ctx.manager.on_engine_error();
    assert_eq!(ctx.manager.state(), EngineState::Error);
    assert!(!ctx.manager.is_timer_armed(TimerKind::Rebind));
    assert_eq!(ctx.states.lock().unwrap().last(), Some(&EngineState::Error));
}

#[test]
fn reset_supersedes_previous_binding() {
    let mut ctx = setup(|_| {});
    ctx.ready();
    let first = ctx.manager.generation();
    ctx.manager.reset();
    assert!(ctx.manager.generation() > first);
    assert_eq!(ctx.manager.state(), EngineState::Bound);
    assert_eq!(*ctx.listener.connects.lock().unwrap(), 2);
}
