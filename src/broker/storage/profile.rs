//! DashMap-based profile storage implementation.
//!
//! Provides lock-free concurrent access to profiles using `DashMap`.
//! Includes a secondary index for per-resource-type listings.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::broker::types::{ConnectionProfile, ResourceType};

use super::traits::ProfileStorage;

/// DashMap-based implementation of `ProfileStorage`.
///
/// Uses two `DashMap` instances:
/// - Primary storage: name -> ConnectionProfile
/// - Secondary index: resource type -> sorted profile names
pub struct DashMapProfileStorage {
    profiles: DashMap<String, ConnectionProfile>,
    names_by_type: DashMap<ResourceType, BTreeSet<String>>,
}

impl DashMapProfileStorage {
    /// Create a new, empty profile storage.
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            names_by_type: DashMap::new(),
        }
    }

    fn unindex(&self, resource_type: ResourceType, name: &str) {
        if let Some(mut names) = self.names_by_type.get_mut(&resource_type) {
            names.remove(name);
            if names.is_empty() {
                drop(names);
                self.names_by_type.remove(&resource_type);
            }
        }
    }
}

impl Default for DashMapProfileStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileStorage for DashMapProfileStorage {
    fn insert(&self, profile: ConnectionProfile) -> Option<ConnectionProfile> {
        let name = profile.name.clone();
        let resource_type = profile.resource_type;
        let previous = self.profiles.insert(name.clone(), profile);
        if let Some(prev) = &previous
            && prev.resource_type != resource_type
        {
            self.unindex(prev.resource_type, &name);
        }
        self.names_by_type
            .entry(resource_type)
            .or_default()
            .insert(name);
        previous
    }

    fn get(&self, name: &str) -> Option<ConnectionProfile> {
        self.profiles.get(name).map(|entry| entry.value().clone())
    }

    fn remove(&self, name: &str) -> Option<ConnectionProfile> {
        let (_, removed) = self.profiles.remove(name)?;
        self.unindex(removed.resource_type, name);
        Some(removed)
    }

    fn list(&self, resource_type: Option<ResourceType>) -> Vec<ConnectionProfile> {
        match resource_type {
            Some(resource_type) => {
                let names: Vec<String> = self
                    .names_by_type
                    .get(&resource_type)
                    .map(|names| names.iter().cloned().collect())
                    .unwrap_or_default();
                names.iter().filter_map(|name| self.get(name)).collect()
            }
            None => {
                let mut all: Vec<ConnectionProfile> =
                    self.profiles.iter().map(|e| e.value().clone()).collect();
                all.sort_by(|a, b| a.name.cmp(&b.name));
                all
            }
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    fn touch(&self, name: &str, at: DateTime<Utc>) -> bool {
        match self.profiles.get_mut(name) {
            Some(mut profile) => {
                profile.last_used_at = Some(at);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::types::ProfileExtra;
    use crate::broker::vault::EncryptedSecret;

    fn profile(name: &str, resource_type: ResourceType) -> ConnectionProfile {
        ConnectionProfile {
            name: name.to_string(),
            resource_type,
            host: "db1".to_string(),
            port: resource_type.default_port(),
            username: "app".to_string(),
            secret: EncryptedSecret {
                iv: "aXY=".to_string(),
                ciphertext: "Y3Q=".to_string(),
            },
            extra: ProfileExtra::default(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let storage = DashMapProfileStorage::new();
        assert!(storage.insert(profile("prod", ResourceType::Sql)).is_none());
        assert!(storage.contains("prod"));
        assert_eq!(storage.get("prod").unwrap().resource_type, ResourceType::Sql);
        assert!(storage.get("missing").is_none());
    }

    #[test]
    fn test_list_by_type_is_sorted() {
        let storage = DashMapProfileStorage::new();
        storage.insert(profile("zeta", ResourceType::Sql));
        storage.insert(profile("alpha", ResourceType::Sql));
        storage.insert(profile("web", ResourceType::Shell));

        let names: Vec<_> = storage
            .list(Some(ResourceType::Sql))
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(storage.list(None).len(), 3);
        assert_eq!(storage.list(Some(ResourceType::Shell)).len(), 1);
    }

    #[test]
    fn test_replacing_with_other_type_moves_index() {
        let storage = DashMapProfileStorage::new();
        storage.insert(profile("box", ResourceType::Sql));
        let previous = storage.insert(profile("box", ResourceType::Shell));

        assert_eq!(previous.unwrap().resource_type, ResourceType::Sql);
        assert!(storage.list(Some(ResourceType::Sql)).is_empty());
        assert_eq!(storage.list(Some(ResourceType::Shell)).len(), 1);
    }

    #[test]
    fn test_remove_clears_index() {
        let storage = DashMapProfileStorage::new();
        storage.insert(profile("prod", ResourceType::Sql));
        assert!(storage.remove("prod").is_some());
        assert!(storage.remove("prod").is_none());
        assert!(storage.list(Some(ResourceType::Sql)).is_empty());
        assert!(!storage.names_by_type.contains_key(&ResourceType::Sql));
    }

    #[test]
    fn test_touch() {
        let storage = DashMapProfileStorage::new();
        storage.insert(profile("prod", ResourceType::Sql));
        let now = Utc::now();
        assert!(storage.touch("prod", now));
        assert_eq!(storage.get("prod").unwrap().last_used_at, Some(now));
        assert!(!storage.touch("missing", now));
    }
}
