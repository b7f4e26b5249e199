//! Interface to the local management-engine driver.
//!
//! The driver itself lives outside this crate; the manager only talks to it
//! through [`EngineBinding`].

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Firmware component description carrying the manageability version.
pub const AMT_COMPONENT: &str = "AMT";

pub const FLAG_EHBC: u32 = 1;
pub const FLAG_CCM: u32 = 2;
pub const FLAG_ACM: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentVersion {
    pub description: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub components: Vec<ComponentVersion>,
}

impl VersionInfo {
    pub fn component(&self, description: &str) -> Option<&str> {
        self.components
            .iter()
            .find(|c| c.description == description)
            .map(|c| c.version.as_str())
    }

    /// Major number of the manageability firmware, e.g. `12` for `12.0.45`.
    pub fn amt_major(&self) -> Option<u32> {
        self.component(AMT_COMPONENT)?
            .split('.')
            .next()
            .and_then(|major| major.trim().parse().ok())
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.components
            .iter()
            .map(|c| (c.description.clone(), c.version.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanInterface {
    pub interface_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Combined view of the raw provisioning state and control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStatus {
    Unprovisioned,
    InProgress,
    ClientControl,
    AdminControl,
}

impl ProvisioningStatus {
    /// `state` is the raw provisioning state (0 pre, 1 in, 2 post) and
    /// `control_mode` the raw control mode (1 client, 2 admin) when known.
    pub fn from_raw(state: u32, control_mode: Option<u32>) -> Self {
        match (state, control_mode) {
            (0, _) => ProvisioningStatus::Unprovisioned,
            (2, Some(2)) => ProvisioningStatus::AdminControl,
            (2, _) => ProvisioningStatus::ClientControl,
            _ => ProvisioningStatus::InProgress,
        }
    }
}

pub trait EngineBinding {
    /// Opens the driver connection. Called at the start of every binding attempt.
    fn bind(&mut self) -> Result<(), EngineError>;
    fn get_protocol_version(&mut self) -> Result<String, EngineError>;
    fn get_version(&mut self) -> Result<VersionInfo, EngineError>;
    fn get_provisioning_mode(&mut self) -> Result<u32, EngineError>;
    fn get_provisioning_state(&mut self) -> Result<u32, EngineError>;
    fn get_ehbc_state(&mut self) -> Result<bool, EngineError>;
    fn get_control_mode(&mut self) -> Result<u32, EngineError>;
    fn get_lan_interface_settings(&mut self, index: u32) -> Result<LanInterface, EngineError>;
    fn get_uuid(&mut self) -> Result<String, EngineError>;
    fn get_dns_suffix(&mut self) -> Result<String, EngineError>;
    fn get_local_system_account(&mut self) -> Result<LocalAccount, EngineError>;
    /// Returns the driver status code; zero means success.
    fn unprovision(&mut self, mode: u32) -> Result<u32, EngineError>;
}

/// Snapshot reported by `get_info`. Field names match what the upstream
/// agent already consumes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    #[serde(rename = "MeiVersion", skip_serializing_if = "Option::is_none")]
    pub mei_version: Option<String>,
    #[serde(rename = "Versions", skip_serializing_if = "Option::is_none")]
    pub versions: Option<BTreeMap<String, String>>,
    #[serde(rename = "ProvisioningMode", skip_serializing_if = "Option::is_none")]
    pub provisioning_mode: Option<u32>,
    #[serde(rename = "ProvisioningState", skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<u32>,
    #[serde(rename = "Flags")]
    pub flags: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net0: Option<LanInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net1: Option<LanInterface>,
    #[serde(rename = "UUID", skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
}

impl EngineInfo {
    /// Queries every field, leaving out the ones the driver fails to answer.
    pub fn collect(engine: &mut dyn EngineBinding) -> Self {
        let mut info = EngineInfo {
            mei_version: engine.get_protocol_version().ok(),
            versions: engine.get_version().ok().map(|v| v.as_map()),
            provisioning_mode: engine.get_provisioning_mode().ok(),
            provisioning_state: engine.get_provisioning_state().ok(),
            ..EngineInfo::default()
        };
        if engine.get_ehbc_state().unwrap_or(false) {
            info.flags += FLAG_EHBC;
        }
        match engine.get_control_mode() {
            Ok(1) => info.flags += FLAG_CCM,
            Ok(2) => info.flags += FLAG_ACM,
            _ => {}
        }
        info.net0 = engine.get_lan_interface_settings(0).ok();
        info.net1 = engine.get_lan_interface_settings(1).ok();
        info.uuid = engine.get_uuid().ok();
        info.dns = engine.get_dns_suffix().ok();
        info
    }
}
