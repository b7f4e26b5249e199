//! Out-of-band management client interface.
//!
//! The manager builds one client per credential through an
//! [`OobClientFactory`] and never mutates a client after construction.

use crate::error::EngineError;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_OOB_HOST: &str = "127.0.0.1";
pub const DEFAULT_OOB_PORT: u16 = 16992;

pub const GENERAL_SETTINGS_CLASS: &str = "AMT_GeneralSettings";
pub const HOST_BASED_SETUP_CLASS: &str = "IPS_HostBasedSetupService";

/// Control mode value used by host-based setup for client control.
pub const CLIENT_CONTROL_MODE: u32 = 2;

pub const STATUS_OK: u16 = 200;

#[derive(Clone, PartialEq, Eq)]
pub struct OobEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub tls: bool,
}

impl std::fmt::Debug for OobEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OobEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Result of a batch enumeration, keyed by class name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub status: u16,
    pub items: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetupResult {
    pub status: u16,
    pub return_value: u32,
    pub return_value_str: String,
}

impl SetupResult {
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.status != STATUS_OK {
            return Err(EngineError::Status(self.status));
        }
        if self.return_value != 0 {
            return Err(EngineError::ReturnValue {
                code: self.return_value,
                message: self.return_value_str,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataChannelRead {
    pub status: u16,
    pub return_value: u32,
    pub realms_bitmap: u32,
    pub message_id: u32,
    /// Base64 encoded payload.
    pub data_message: String,
}

impl DataChannelRead {
    /// Decoded text payload, or `None` when the read carries no usable data.
    pub fn text(&self) -> Option<String> {
        if self.status != STATUS_OK || self.return_value != 0 {
            return None;
        }
        let bytes = B64.decode(self.data_message.as_bytes()).ok()?;
        Some(String::from_utf8_lossy(&bytes).to_string())
    }
}

pub trait OobClient {
    fn batch_enumerate(&mut self, class_names: &[&str]) -> Result<BatchResponse, EngineError>;
    fn host_based_setup(&mut self, mode: u32, digest: &str) -> Result<SetupResult, EngineError>;
    fn data_channel_read(&mut self) -> Result<DataChannelRead, EngineError>;
    /// `payload` is already base64 encoded.
    fn data_channel_write(&mut self, payload: &str) -> Result<(), EngineError>;
}

pub trait OobClientFactory {
    fn connect(&mut self, endpoint: &OobEndpoint) -> Result<Box<dyn OobClient>, EngineError>;
}

/// Fields read from the activation enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationInfo {
    pub digest_realm: String,
    pub allowed_control_modes: Vec<u32>,
}

impl ActivationInfo {
    pub fn from_batch(batch: &BatchResponse) -> Result<Self, EngineError> {
        if batch.status != STATUS_OK {
            return Err(EngineError::Status(batch.status));
        }
        let digest_realm = batch
            .items
            .get(GENERAL_SETTINGS_CLASS)
            .and_then(|v| v.get("DigestRealm"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Parse("missing DigestRealm".to_string()))?
            .to_string();
        let allowed_control_modes = batch
            .items
            .get(HOST_BASED_SETUP_CLASS)
            .and_then(|v| v.get("AllowedControlModes"))
            .map(parse_modes)
            .ok_or_else(|| EngineError::Parse("missing AllowedControlModes".to_string()))?;
        Ok(Self {
            digest_realm,
            allowed_control_modes,
        })
    }

    /// Client control activation is offered when the engine lists both
    /// control modes, one of them being client control.
    pub fn allows_client_control(&self) -> bool {
        self.allowed_control_modes.len() == 2
            && self.allowed_control_modes.contains(&CLIENT_CONTROL_MODE)
    }
}

fn parse_modes(value: &Value) -> Vec<u32> {
    let as_mode = |v: &Value| -> Option<u32> {
        v.as_u64()
            .map(|n| n as u32)
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    };
    match value {
        Value::Array(items) => items.iter().filter_map(as_mode).collect(),
        other => as_mode(other).into_iter().collect(),
    }
}

pub fn encode_payload(text: &str) -> String {
    B64.encode(text.as_bytes())
}
