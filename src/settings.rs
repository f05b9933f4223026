use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::paths::write_atomic;

pub const CLOSE_BEHAVIOR_KEY: &str = "close_behavior";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseBehavior {
    Ask,
    Minimize,
    Exit,
}

impl CloseBehavior {
    fn to_value(self) -> Value {
        match self {
            Self::Ask => Value::Null,
            Self::Minimize => Value::String("minimize".into()),
            Self::Exit => Value::String("exit".into()),
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("minimize") => Self::Minimize,
            Some("exit") => Self::Exit,
            _ => Self::Ask,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    selection_path: PathBuf,
    values: Map<String, Value>,
}

impl SettingsStore {
    pub fn open(path: PathBuf, selection_path: PathBuf) -> Self {
        let mut store = Self {
            path,
            selection_path,
            values: defaults(),
        };
        store.load();
        store
    }

    pub fn load(&mut self) {
        let mut values = defaults();
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                // Loaded values land on top of the defaults, so new recognized
                // keys appear in old installations without migration code.
                Ok(loaded) => values.extend(loaded),
                Err(error) => {
                    log::warn!(
                        "[settings] failed to parse {}: {error}",
                        self.path.display()
                    );
                }
            },
            Err(_) => {
                log::info!(
                    "[settings] no settings file at {}, using defaults",
                    self.path.display()
                );
            }
        }
        self.values = values;
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) -> bool {
        self.values.insert(key.to_string(), value);
        self.save()
    }

    pub fn close_behavior(&self) -> CloseBehavior {
        CloseBehavior::from_value(self.values.get(CLOSE_BEHAVIOR_KEY))
    }

    pub fn set_close_behavior(&mut self, behavior: CloseBehavior) -> bool {
        self.set(CLOSE_BEHAVIOR_KEY, behavior.to_value())
    }

    fn save(&self) -> bool {
        let content = match serde_json::to_string_pretty(&self.values) {
            Ok(content) => content,
            Err(error) => {
                log::warn!("[settings] failed to serialize settings: {error}");
                return false;
            }
        };
        match write_atomic(&self.path, content.as_bytes()) {
            Ok(()) => true,
            Err(error) => {
                log::warn!(
                    "[settings] failed to write {}: {error}",
                    self.path.display()
                );
                false
            }
        }
    }

    pub fn load_last_selection(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.selection_path).ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn save_last_selection(&self, profile_id: &str) -> bool {
        match std::fs::write(&self.selection_path, profile_id) {
            Ok(()) => true,
            Err(error) => {
                log::warn!(
                    "[settings] failed to write {}: {error}",
                    self.selection_path.display()
                );
                false
            }
        }
    }
}

fn defaults() -> Map<String, Value> {
    let mut values = Map::new();
    values.insert(CLOSE_BEHAVIOR_KEY.to_string(), Value::Null);
    values
}
