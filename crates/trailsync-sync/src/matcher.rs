//! Attaches existing board item handles to registry entries.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use trailsync_core::{CanonicalRegistry, IdentityKey, InventoryItem, RemoteHandle};

use crate::SyncError;

/// Two or more board items share a display name; the first one seen is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchAmbiguity {
    pub key: IdentityKey,
    pub kept: RemoteHandle,
    pub ignored: RemoteHandle,
}

impl fmt::Display for MatchAmbiguity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "display name {} is used by items {} and {}; keeping {}",
            self.key, self.kept, self.ignored, self.kept
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguities: Vec<MatchAmbiguity>,
}

/// Display name index over the snapshot, first handle wins.
pub fn index_inventory(inventory: &[InventoryItem]) -> (HashMap<IdentityKey, RemoteHandle>, Vec<MatchAmbiguity>) {
    let mut index: HashMap<IdentityKey, RemoteHandle> = HashMap::with_capacity(inventory.len());
    let mut ambiguities = Vec::new();

    for item in inventory {
        let Some(key) = IdentityKey::normalize(&item.display_name) else {
            debug!(handle = %item.remote_handle, "board item without a usable name");
            continue;
        };
        match index.get(&key) {
            Some(kept) => {
                let ambiguity = MatchAmbiguity {
                    key,
                    kept: kept.clone(),
                    ignored: item.remote_handle.clone(),
                };
                warn!(error = %SyncError::MatchAmbiguity(ambiguity.clone()), "ambiguous board inventory");
                ambiguities.push(ambiguity);
            }
            None => {
                index.insert(key, item.remote_handle.clone());
            }
        }
    }

    (index, ambiguities)
}

/// Sets `remote_handle` on every entry whose key names a board item; clears it otherwise.
pub fn match_inventory(registry: &mut CanonicalRegistry, inventory: &[InventoryItem]) -> MatchReport {
    let (index, ambiguities) = index_inventory(inventory);
    let mut report = MatchReport {
        ambiguities,
        ..MatchReport::default()
    };

    for (key, record) in registry.iter_mut() {
        record.remote_handle = index.get(key).cloned();
        if record.remote_handle.is_some() {
            report.matched += 1;
        } else {
            report.unmatched += 1;
        }
    }

    report
}
