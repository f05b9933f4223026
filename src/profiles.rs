use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::paths::write_atomic;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub auto_start: bool,
}

pub struct ProfileStore {
    path: PathBuf,
    profiles: Vec<Profile>,
}

impl ProfileStore {
    pub fn open(path: PathBuf) -> Self {
        let mut store = Self {
            path,
            profiles: Vec::new(),
        };
        store.load();
        store
    }

    pub fn load(&mut self) {
        self.profiles = match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Vec<Profile>>(&content) {
                Ok(profiles) => profiles,
                Err(error) => {
                    log::warn!(
                        "[profiles] failed to parse {}: {error}",
                        self.path.display()
                    );
                    Vec::new()
                }
            },
            Err(_) => {
                log::info!(
                    "[profiles] no profile file at {}, starting empty",
                    self.path.display()
                );
                Vec::new()
            }
        };
        self.ensure_ids();
    }

    // Records written by old releases carry no id. Assign one per record and
    // rewrite the file once so the assignment survives the session.
    fn ensure_ids(&mut self) {
        let mut assigned = 0usize;
        for profile in &mut self.profiles {
            if profile.id.is_empty() {
                profile.id = Uuid::new_v4().to_string();
                assigned += 1;
            }
        }
        if assigned > 0 {
            log::info!("[profiles] backfilled {assigned} profile id(s)");
            self.save();
        }
    }

    pub fn save(&self) -> bool {
        let content = match serde_json::to_string_pretty(&self.profiles) {
            Ok(content) => content,
            Err(error) => {
                log::warn!("[profiles] failed to serialize profiles: {error}");
                return false;
            }
        };
        match write_atomic(&self.path, content.as_bytes()) {
            Ok(()) => true,
            Err(error) => {
                log::warn!(
                    "[profiles] failed to write {}: {error}",
                    self.path.display()
                );
                false
            }
        }
    }

    pub fn add(&mut self, name: &str, server: &str, key: &str, auto_start: bool) -> bool {
        self.profiles.push(Profile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            server: server.to_string(),
            key: key.to_string(),
            auto_start,
        });
        self.save()
    }

    pub fn update(
        &mut self,
        index: usize,
        name: &str,
        server: &str,
        key: &str,
        auto_start: bool,
    ) -> bool {
        let Some(profile) = self.profiles.get_mut(index) else {
            return false;
        };
        let id = if profile.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            profile.id.clone()
        };
        *profile = Profile {
            id,
            name: name.to_string(),
            server: server.to_string(),
            key: key.to_string(),
            auto_start,
        };
        self.save()
    }

    pub fn delete(&mut self, index: usize) -> bool {
        if index >= self.profiles.len() {
            return false;
        }
        self.profiles.remove(index);
        self.save()
    }

    pub fn get(&self, index: usize) -> Option<&Profile> {
        self.profiles.get(index)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn get_all(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn auto_start_profiles(&self) -> Vec<Profile> {
        self.profiles
            .iter()
            .filter(|profile| profile.auto_start)
            .cloned()
            .collect()
    }
}
