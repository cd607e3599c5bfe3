//! Storage trait definitions for profile management.

use chrono::{DateTime, Utc};

use crate::broker::types::{ConnectionProfile, ResourceType};

/// Trait for profile storage operations.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. The default implementation uses `DashMap` for lock-free
/// concurrent access.
pub trait ProfileStorage: Send + Sync {
    /// Insert or replace a profile, returning the previous one.
    fn insert(&self, profile: ConnectionProfile) -> Option<ConnectionProfile>;

    /// Get a profile by name, returning a clone.
    fn get(&self, name: &str) -> Option<ConnectionProfile>;

    /// Remove a profile by name, returning it if it existed.
    fn remove(&self, name: &str) -> Option<ConnectionProfile>;

    /// List profiles, optionally only those of one resource type.
    fn list(&self, resource_type: Option<ResourceType>) -> Vec<ConnectionProfile>;

    /// Check if a profile exists.
    fn contains(&self, name: &str) -> bool;

    /// Stamp `last_used_at`. Returns false for unknown profiles.
    fn touch(&self, name: &str, at: DateTime<Utc>) -> bool;
}
