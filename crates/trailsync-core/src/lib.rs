//! Core domain model for trailer location reconciliation.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "trailsync-core";

/// Telemetry feeds the pipeline knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Skybitz,
    Samsara,
    Insight,
}

impl FeedKind {
    /// Reference precedence: later entries overwrite earlier ones.
    pub const DEFAULT_ORDER: [FeedKind; 3] = [FeedKind::Skybitz, FeedKind::Samsara, FeedKind::Insight];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Skybitz => "skybitz",
            FeedKind::Samsara => "samsara",
            FeedKind::Insight => "insight",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable asset identity shared by every feed and the downstream board.
///
/// Always built through [`IdentityKey::normalize`], so two keys compare equal
/// exactly when their raw spellings normalize to the same text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

const TRAILER_PREFIX: &str = "TRL#";

impl IdentityKey {
    /// Trim, drop an optional `TRL#` prefix, collapse inner whitespace, uppercase.
    /// Returns `None` when nothing is left.
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let unprefixed = strip_prefix_ignore_case(trimmed, TRAILER_PREFIX)
            .map(str::trim_start)
            .unwrap_or(trimmed);
        let collapsed = unprefixed.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return None;
        }
        Some(Self(collapsed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&input[prefix.len()..])
    } else {
        None
    }
}

/// Opaque id of an item that already exists on the board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical per-asset location record. Absent values stay `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub full_address: Option<String>,
    pub address_street: Option<String>,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    pub address_country: Option<String>,
    pub address_postal: Option<String>,
    pub idle_duration: Option<String>,
    pub serial_data: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub remote_handle: Option<RemoteHandle>,
}

/// Identity-keyed registry that iterates in first-insertion order.
///
/// Replacing a record keeps the key at its original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalRegistry {
    entries: Vec<(IdentityKey, CanonicalRecord)>,
    positions: HashMap<IdentityKey, usize>,
}

impl CanonicalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whole-record replacement; returns the record that was displaced, if any.
    pub fn insert(&mut self, key: IdentityKey, record: CanonicalRecord) -> Option<CanonicalRecord> {
        match self.positions.get(&key) {
            Some(&idx) => Some(std::mem::replace(&mut self.entries[idx].1, record)),
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, record));
                None
            }
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&CanonicalRecord> {
        self.positions.get(key).map(|&idx| &self.entries[idx].1)
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.positions.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, &CanonicalRecord)> {
        self.entries.iter().map(|(k, r)| (k, r))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&IdentityKey, &mut CanonicalRecord)> {
        self.entries.iter_mut().map(|entry| (&entry.0, &mut entry.1))
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.entries.iter().map(|(k, _)| k)
    }
}

/// One row of the downstream board inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub remote_handle: RemoteHandle,
    pub display_name: String,
}

impl InventoryItem {
    pub fn new(remote_handle: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            remote_handle: RemoteHandle::new(remote_handle),
            display_name: display_name.into(),
        }
    }
}
