use crate::error::StoreError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const POLICY_KEY: &str = "amtPolicy";
pub const CCM_PASSWORD_KEY: &str = "amtCCMPass";

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// String values kept in a single JSON object file, replaced atomically on
/// every write.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Map<String, Value> {
        match read_json_value(&self.path) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.read_all()
            .get(key)
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
    }

    fn put(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut map = self.read_all();
        map.insert(key.to_string(), Value::String(value.to_string()));
        write_json_atomic(&self.path, &Value::Object(map))
    }
}

fn read_json_value(path: &Path) -> Option<Value> {
    let data = fs::read_to_string(path).ok()?;
    if data.trim().is_empty() {
        return Some(Value::Object(Map::new()));
    }
    serde_json::from_str(&data).ok()
}

fn write_json_atomic(path: &Path, value: &Value) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = sibling_path(path, "tmp");
    fs::write(&tmp_path, bytes)?;
    if !path.exists() {
        fs::rename(&tmp_path, path)?;
        return Ok(());
    }
    let bak_path = sibling_path(path, "bak");
    fs::rename(path, &bak_path)?;
    match fs::rename(&tmp_path, path) {
        Ok(()) => {
            let _ = fs::remove_file(bak_path);
            Ok(())
        }
        Err(err) => {
            let _ = fs::rename(&bak_path, path);
            Err(err.into())
        }
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("store.json");
    path.with_file_name(format!("{}.{}", file_name, suffix))
}
