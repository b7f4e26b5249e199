use crate::error::ConfigError;
use amt_core::{ManagerConfig, Platform};
use configparser::ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod paths;

#[derive(Debug, Clone)]
pub struct AgentConfig {
  pub debug: bool,
  pub data_dir: PathBuf,
  pub platform: Option<Platform>,
  pub manager: ManagerConfig,
}

impl Default for AgentConfig {
  fn default() -> Self {
    Self {
      debug: false,
      data_dir: PathBuf::from("."),
      platform: None,
      manager: ManagerConfig::default(),
    }
  }
}

impl AgentConfig {
  pub fn store_path(&self) -> PathBuf {
    paths::store_path(&self.data_dir)
  }

  pub fn platform(&self) -> Platform {
    self.platform.unwrap_or_else(Platform::current)
  }
}

fn parse_bool(val: &str) -> Option<bool> {
  match val.trim().to_lowercase().as_str() {
    "1" | "true" | "yes" => Some(true),
    "0" | "false" | "no" => Some(false),
    _ => None,
  }
}

fn parse_u32(val: &str) -> Option<u32> {
  let trimmed = val.trim();
  if let Some(hex) = trimmed.strip_prefix("0x") {
    u32::from_str_radix(hex, 16).ok()
  } else {
    trimmed.parse::<u32>().ok()
  }
}

fn read_bool(parser: &Ini, section: &str, key: &str, default: bool) -> bool {
  parser
    .get(section, key)
    .and_then(|v| parse_bool(&v))
    .unwrap_or(default)
}

fn read_u32(parser: &Ini, section: &str, key: &str, default: u32) -> u32 {
  parser
    .get(section, key)
    .and_then(|v| parse_u32(&v))
    .unwrap_or(default)
}

fn read_string(parser: &Ini, section: &str, key: &str, default: &str) -> String {
  parser
    .get(section, key)
    .unwrap_or_else(|| default.to_string())
}

fn read_secs(parser: &Ini, section: &str, key: &str, default: Duration) -> Duration {
  Duration::from_secs(read_u32(parser, section, key, default.as_secs() as u32) as u64)
}

/// Missing file means defaults.
pub fn load_agent_config(path: &Path) -> Result<AgentConfig, ConfigError> {
  let mut parser = Ini::new();
  if path.exists() {
    parser
      .load(path.to_string_lossy().as_ref())
      .map_err(ConfigError::Parse)?;
  }

  let mut cfg = AgentConfig::default();

  cfg.debug = read_bool(&parser, "agent", "debug", cfg.debug);
  let data_dir = read_string(&parser, "agent", "dataDir", "");
  if !data_dir.trim().is_empty() {
    cfg.data_dir = PathBuf::from(data_dir.trim());
  }
  let platform = read_string(&parser, "agent", "platform", "");
  if !platform.trim().is_empty() {
    cfg.platform = Some(
      Platform::from_wire_name(&platform)
        .ok_or_else(|| ConfigError::Parse(format!("unknown platform {}", platform)))?,
    );
  }

  let manager = &mut cfg.manager;
  manager.debug = cfg.debug;
  let reconcile = &mut manager.reconcile;
  reconcile.retry_limit = read_u32(&parser, "engine", "retryLimit", reconcile.retry_limit);
  reconcile.rebind_delay = read_secs(&parser, "engine", "rebindDelaySecs", reconcile.rebind_delay);
  reconcile.settle_delay = read_secs(&parser, "engine", "policySettleSecs", reconcile.settle_delay);
  reconcile.kvm_enabled = read_bool(&parser, "kvm", "enable", reconcile.kvm_enabled);
  reconcile.kvm_min_major = read_u32(&parser, "kvm", "minMajorVersion", reconcile.kvm_min_major);
  manager.kvm_poll = read_secs(&parser, "kvm", "pollSecs", manager.kvm_poll);
  manager.oob_host = read_string(&parser, "engine", "oobHost", &manager.oob_host);
  let port = read_u32(&parser, "engine", "oobPort", manager.oob_port as u32);
  manager.oob_port = u16::try_from(port)
    .map_err(|_| ConfigError::Parse(format!("oobPort out of range: {}", port)))?;

  Ok(cfg)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  #[test]
  fn missing_file_yields_defaults() {
    let tmp = TempDir::new().unwrap();
    let cfg = load_agent_config(&tmp.path().join("absent.ini")).unwrap();
    assert!(!cfg.debug);
    assert_eq!(cfg.manager.reconcile.retry_limit, 10);
    assert_eq!(cfg.manager.reconcile.rebind_delay, Duration::from_secs(10));
    assert_eq!(cfg.manager.reconcile.settle_delay, Duration::from_secs(8));
    assert_eq!(cfg.manager.kvm_poll, Duration::from_secs(2));
    assert_eq!(cfg.manager.oob_port, 16992);
    assert_eq!(cfg.store_path(), PathBuf::from("./amt-store.json"));
  }

  #[test]
  fn reads_every_section() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("amt-agent.ini");
    fs::write(
      &path,
      "[agent]\ndebug=1\ndataDir=/var/lib/amt\nplatform=linux\n\
       [engine]\nretryLimit=3\nrebindDelaySecs=0x1e\noobHost=10.0.0.2\noobPort=16993\n\
       [kvm]\nenable=no\nminMajorVersion=14\npollSecs=5\n",
    )
    .unwrap();
    let cfg = load_agent_config(&path).unwrap();
    assert!(cfg.debug);
    assert!(cfg.manager.debug);
    assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/amt"));
    assert_eq!(cfg.platform, Some(Platform::Linux));
    assert_eq!(cfg.manager.reconcile.retry_limit, 3);
    assert_eq!(cfg.manager.reconcile.rebind_delay, Duration::from_secs(30));
    assert!(!cfg.manager.reconcile.kvm_enabled);
    assert_eq!(cfg.manager.reconcile.kvm_min_major, 14);
    assert_eq!(cfg.manager.kvm_poll, Duration::from_secs(5));
    assert_eq!(cfg.manager.oob_host, "10.0.0.2");
    assert_eq!(cfg.manager.oob_port, 16993);
  }

  #[test]
  fn rejects_out_of_range_port() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("amt-agent.ini");
    fs::write(&path, "[engine]\noobPort=70000\n").unwrap();
    assert!(matches!(load_agent_config(&path), Err(ConfigError::Parse(_))));
  }
}
