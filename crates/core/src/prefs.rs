//! Per-user default parameters, persisted as one JSON blob.
//!
//! The on-disk shape is `{user_id: {param_name: value, ...}, ...}`. Unknown
//! keys are preserved verbatim across load/save cycles but never handed out:
//! only names the registry declares are honored at read time, coerced to the
//! declared kind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::params::{ParamRegistry, ParamValue};

type PrefsMap = BTreeMap<String, serde_json::Map<String, Value>>;

#[derive(Debug)]
pub struct PreferencesStore {
    path: PathBuf,
    inner: Mutex<PrefsMap>,
}

fn to_json(value: &ParamValue) -> Value {
    match value {
        ParamValue::Bool(v) => Value::Bool(*v),
        ParamValue::Int(v) => Value::from(*v),
        ParamValue::Float(v) => Value::from(*v),
        ParamValue::Str(v) => Value::String(v.clone()),
    }
}

fn from_json(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Bool(v) => Some(ParamValue::Bool(*v)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ParamValue::Int(i))
            } else {
                n.as_f64().map(ParamValue::Float)
            }
        }
        Value::String(s) => Some(ParamValue::Str(s.clone())),
        _ => None,
    }
}

impl PreferencesStore {
    /// Load the store from `path`; a missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let map: PrefsMap = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            PrefsMap::new()
        };
        Ok(Self { path, inner: Mutex::new(map) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PrefsMap> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Read one preference. Returns `None` for unknown users, names the
    /// registry does not declare, and values of the wrong JSON shape.
    pub fn get(&self, registry: &ParamRegistry, user: u64, name: &str) -> Option<ParamValue> {
        let kind = registry.spec(name)?;
        let map = self.lock();
        let raw = map.get(&user.to_string())?.get(name)?;
        let value = from_json(raw)?;
        Some(kind.validate(&value))
    }

    pub fn set(&self, user: u64, name: &str, value: &ParamValue) {
        let mut map = self.lock();
        map.entry(user.to_string())
            .or_default()
            .insert(name.to_string(), to_json(value));
    }

    /// All stored preferences for a user that name declared parameters.
    pub fn known_for(&self, registry: &ParamRegistry, user: u64) -> Vec<(String, ParamValue)> {
        let map = self.lock();
        let Some(user_map) = map.get(&user.to_string()) else {
            return Vec::new();
        };
        user_map
            .iter()
            .filter(|(name, _)| registry.is_param(name))
            .filter_map(|(name, raw)| from_json(raw).map(|v| (name.clone(), v)))
            .collect()
    }

    /// Write the whole store atomically (write-temp + rename), off the
    /// async runtime's worker threads.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let path = self.path.clone();
        let snapshot = self.lock().clone();
        tokio::task::spawn_blocking(move || persist_file(&path, &snapshot))
            .await
            .map_err(|err| anyhow::anyhow!("persist preferences: {err:#}"))??;
        Ok(())
    }

    /// Synchronous variant for shutdown paths where the runtime is winding
    /// down.
    pub fn persist_blocking(&self) -> anyhow::Result<()> {
        let snapshot = self.lock().clone();
        persist_file(&self.path, &snapshot)
    }
}

fn persist_file(path: &Path, map: &PrefsMap) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let json = serde_json::to_string_pretty(map)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamRegistry, PixelCeilings, CFG, PREFIX, STEPS, VAE};

    fn registry() -> ParamRegistry {
        ParamRegistry::new(
            vec!["test model".to_string()],
            None,
            Vec::new(),
            PixelCeilings::default(),
        )
        .unwrap()
    }

    #[test]
    fn empty_store_has_no_preferences() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load(dir.path().join("prefs.json")).unwrap();
        assert!(store.get(&registry(), 1, STEPS).is_none());
        assert!(store.known_for(&registry(), 1).is_empty());
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load(dir.path().join("prefs.json")).unwrap();
        let reg = registry();

        store.set(1, STEPS, &ParamValue::Int(40));
        store.set(1, CFG, &ParamValue::Float(7.5));
        store.set(1, PREFIX, &ParamValue::Str("masterpiece".to_string()));
        store.set(1, VAE, &ParamValue::Str("None".to_string()));

        assert_eq!(store.get(&reg, 1, STEPS), Some(ParamValue::Int(40)));
        assert_eq!(store.get(&reg, 1, CFG), Some(ParamValue::Float(7.5)));
        assert_eq!(
            store.get(&reg, 1, PREFIX),
            Some(ParamValue::Str("masterpiece".to_string()))
        );
        assert_eq!(store.get(&reg, 1, VAE), Some(ParamValue::Str("None".to_string())));
        assert!(store.get(&reg, 2, STEPS).is_none());
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let reg = registry();

        let store = PreferencesStore::load(&path).unwrap();
        store.set(1, STEPS, &ParamValue::Int(33));
        store.set(1, CFG, &ParamValue::Float(9.25));
        store.set(1, PREFIX, &ParamValue::Str("oil painting".to_string()));
        store.set(1, VAE, &ParamValue::Str("None".to_string()));
        store.persist().await.unwrap();

        let reloaded = PreferencesStore::load(&path).unwrap();
        assert_eq!(reloaded.get(&reg, 1, STEPS), Some(ParamValue::Int(33)));
        assert_eq!(reloaded.get(&reg, 1, CFG), Some(ParamValue::Float(9.25)));
        assert_eq!(
            reloaded.get(&reg, 1, PREFIX),
            Some(ParamValue::Str("oil painting".to_string()))
        );
        assert_eq!(
            reloaded.get(&reg, 1, VAE),
            Some(ParamValue::Str("None".to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_keys_survive_on_disk_but_are_ignored_at_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(
            &path,
            r#"{"1": {"steps": 30, "future_feature": "kept"}}"#,
        )
        .unwrap();

        let store = PreferencesStore::load(&path).unwrap();
        let reg = registry();
        assert_eq!(store.get(&reg, 1, STEPS), Some(ParamValue::Int(30)));
        assert!(store.get(&reg, 1, "future_feature").is_none());

        store.set(1, STEPS, &ParamValue::Int(31));
        store.persist().await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("future_feature"));
        assert!(raw.contains("kept"));
    }

    #[test]
    fn out_of_range_stored_values_are_clamped_at_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load(dir.path().join("prefs.json")).unwrap();
        let reg = registry();
        store.set(1, STEPS, &ParamValue::Int(500));
        assert_eq!(store.get(&reg, 1, STEPS), Some(ParamValue::Int(50)));
    }
}
