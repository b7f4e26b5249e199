use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "AMT_AGENT_CONFIG";
const CONFIG_FILE: &str = "amt-agent.ini";
const STORE_FILE: &str = "amt-store.json";

pub fn agent_config_path() -> PathBuf {
  if let Ok(custom) = env::var(CONFIG_ENV) {
    if !custom.trim().is_empty() {
      return PathBuf::from(custom);
    }
  }
  Path::new(".").join(CONFIG_FILE)
}

pub fn store_path(data_dir: &Path) -> PathBuf {
  data_dir.join(STORE_FILE)
}
