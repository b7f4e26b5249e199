use crate::config::AgentConfig;
use crate::error::{ApiError, ApiResult, ErrorCode};
use amt_core::kvm::peer::DataChannel;
use amt_core::store::{CCM_PASSWORD_KEY, POLICY_KEY};
use amt_core::{
    activation_digest, ControlSession, JsonFileStore, KeyValueStore, LocalFiles, Policy,
    TunnelError, WorkstationLocker,
};
use serde::Serialize;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub store: String,
    pub policy: Option<Policy>,
    pub ccm_password_stored: bool,
    pub engine: EngineSettings,
}

/// Manager settings the agent would run with, as loaded from the INI.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    pub endpoint: String,
    pub retry_limit: u32,
    pub kvm_enabled: bool,
    pub kvm_min_major: u32,
}

impl EngineSettings {
    fn from_config(config: &AgentConfig) -> Self {
        let manager = &config.manager;
        Self {
            endpoint: format!("{}:{}", manager.oob_host, manager.oob_port),
            retry_limit: manager.reconcile.retry_limit,
            kvm_enabled: manager.reconcile.kvm_enabled,
            kvm_min_major: manager.reconcile.kvm_min_major,
        }
    }
}

pub fn status_cmd(config: &AgentConfig) -> ApiResult<StatusReport> {
    let store = JsonFileStore::new(config.store_path());
    let policy = match store.get(POLICY_KEY) {
        Some(raw) => Some(Policy::from_json(&raw).map_err(|e| {
            ApiError::with_details(ErrorCode::Parse, "stored policy is unreadable", e.to_string())
        })?),
        None => None,
    };
    Ok(StatusReport {
        store: store.path().display().to_string(),
        policy,
        ccm_password_stored: store
            .get(CCM_PASSWORD_KEY)
            .map(|p| !p.is_empty())
            .unwrap_or(false),
        engine: EngineSettings::from_config(config),
    })
}

pub fn set_policy_cmd(config: &AgentConfig, raw: &str) -> ApiResult<Policy> {
    let policy = Policy::from_json(raw).map_err(|e| {
        ApiError::with_details(ErrorCode::InvalidInput, "invalid policy", e.to_string())
    })?;
    fs::create_dir_all(&config.data_dir)?;
    let mut store = JsonFileStore::new(config.store_path());
    store.put(POLICY_KEY, &serde_json::to_string(&policy)?)?;
    info!(kind = ?policy.kind, "policy stored");
    Ok(policy)
}

pub fn digest_cmd(user: &str, realm: &str, password: &str) -> String {
    activation_digest(user, realm, password)
}

/// Line-oriented data channel: one frame per line.
struct LineChannel<W: Write> {
    out: W,
}

impl<W: Write> DataChannel for LineChannel<W> {
    fn write_text(&mut self, text: &str) -> Result<(), TunnelError> {
        writeln!(self.out, "{}", text)?;
        self.out.flush()?;
        Ok(())
    }

    fn write_binary(&mut self, _data: &[u8]) -> Result<(), TunnelError> {
        Err(TunnelError::Channel("binary frames are not supported on this channel".to_string()))
    }

    fn close(&mut self) -> Result<(), TunnelError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Serves the control protocol over a pair of line streams until the input
/// ends.
pub fn ctrl_cmd<R: BufRead, W: Write>(
    config: &AgentConfig,
    root: Option<PathBuf>,
    input: R,
    output: W,
) -> ApiResult<()> {
    let files = match root {
        Some(root) => LocalFiles::rooted(root),
        None => LocalFiles::new(),
    };
    let mut session = ControlSession::new(config.platform(), Rc::new(files), Rc::new(WorkstationLocker));
    let mut channel = LineChannel { out: output };
    for line in input.lines() {
        let line = line?;
        let frame = line.trim_end_matches(['\r', '\n']);
        if frame.is_empty() {
            continue;
        }
        session.handle_frame(&mut channel, frame);
    }
    debug!("control input closed");
    session.close_transfers();
    channel.close()?;
    Ok(())
}
