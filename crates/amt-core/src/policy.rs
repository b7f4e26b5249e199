use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PolicyType {
    #[default]
    None,
    DeactivateClientMode,
    ActivateClientMode,
}

impl TryFrom<u8> for PolicyType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PolicyType::None),
            1 => Ok(PolicyType::DeactivateClientMode),
            2 => Ok(PolicyType::ActivateClientMode),
            other => Err(format!("unknown policy type {}", other)),
        }
    }
}

impl From<PolicyType> for u8 {
    fn from(value: PolicyType) -> Self {
        match value {
            PolicyType::None => 0,
            PolicyType::DeactivateClientMode => 1,
            PolicyType::ActivateClientMode => 2,
        }
    }
}

/// What to do when the stored admin password no longer opens the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BadPasswordAction {
    #[default]
    Ignore,
    Reactivate,
}

impl TryFrom<u8> for BadPasswordAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BadPasswordAction::Ignore),
            1 => Ok(BadPasswordAction::Reactivate),
            other => Err(format!("unknown bad password action {}", other)),
        }
    }
}

impl From<BadPasswordAction> for u8 {
    fn from(value: BadPasswordAction) -> Self {
        match value {
            BadPasswordAction::Ignore => 0,
            BadPasswordAction::Reactivate => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "type")]
    pub kind: PolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "badpass", default)]
    pub bad_password_action: BadPasswordAction,
}

impl Policy {
    pub fn new(kind: PolicyType) -> Self {
        Self {
            kind,
            ..Policy::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_bad_password_action(mut self, action: BadPasswordAction) -> Self {
        self.bad_password_action = action;
        self
    }

    /// The password carried by the policy, treating an empty string as absent.
    pub fn explicit_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
