// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory cache of triggered limits with store persistence.
//!
//! The cache is refreshed from every successful `/track` response and
//! consulted on every track call. Readers take a shared lock and never block
//! each other; only [`TriggeredLimitCache::replace_all`] takes the writer
//! lock. The current limit set is mirrored into the `[triggered_limits]`
//! section of the configuration store (base64 payload + sha256 checksum) so
//! a fresh process starts with the last known state.

use std::collections::HashMap;
use std::sync::RwLock;

use aicm_core::AicmError;
use aicm_config::ConfigStore;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::model::TriggeredLimit;

const PAYLOAD_KEY: &str = "payload";
const CHECKSUM_KEY: &str = "checksum";
const SECTION: &str = "triggered_limits";

/// Outcome of [`TriggeredLimitCache::load_from_store_if_empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Limits were loaded from the store.
    Loaded(usize),
    /// The store had no cached limits.
    Empty,
    /// The blob was present but its checksum did not verify; the cache
    /// stays empty and the caller should schedule a server refresh.
    ChecksumMismatch,
    /// The cache already held limits; the store was not consulted.
    AlreadyPopulated,
}

/// Shared cache of the current triggered-limit set.
pub struct TriggeredLimitCache {
    by_api_key: RwLock<HashMap<String, Vec<TriggeredLimit>>>,
    store: Option<ConfigStore>,
}

impl TriggeredLimitCache {
    /// A cache backed by the given configuration store.
    pub fn new(store: Option<ConfigStore>) -> Self {
        Self {
            by_api_key: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Atomically swap the limit set and persist it to the store.
    pub fn replace_all(&self, limits: Vec<TriggeredLimit>) -> Result<(), AicmError> {
        let mut index: HashMap<String, Vec<TriggeredLimit>> = HashMap::new();
        for limit in &limits {
            index
                .entry(limit.api_key_id.clone())
                .or_default()
                .push(limit.clone());
        }
        {
            let mut guard = self
                .by_api_key
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = index;
        }
        debug!(count = limits.len(), "triggered limits replaced");
        self.persist(&limits)
    }

    /// Authoritative limit list arrived in a server response.
    pub fn notify(&self, limits: Vec<TriggeredLimit>) {
        if let Err(err) = self.replace_all(limits) {
            // Delivery must not fail because the local mirror could not be
            // written; the in-memory set is already current.
            warn!(error = %err, "failed to persist triggered limits");
        }
    }

    /// Return the first matching limit with `threshold_type == LIMIT`.
    ///
    /// `api_key_id` narrows the scan to one index bucket; `None` scans all
    /// buckets (the server only ever returns limits scoped to the caller's
    /// credential, so the wildcard scan is still correct).
    pub fn check(
        &self,
        api_key_id: Option<&str>,
        service_key: &str,
        customer_key: Option<&str>,
    ) -> Option<TriggeredLimit> {
        let guard = self
            .by_api_key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let buckets: Vec<&Vec<TriggeredLimit>> = match api_key_id {
            Some(key) => guard.get(key).into_iter().collect(),
            None => guard.values().collect(),
        };
        for bucket in buckets {
            for limit in bucket {
                let scope_key = api_key_id.unwrap_or(&limit.api_key_id);
                if limit.is_blocking() && limit.matches(scope_key, service_key, customer_key) {
                    return Some(limit.clone());
                }
            }
        }
        None
    }

    /// Number of cached limits across all buckets.
    pub fn len(&self) -> usize {
        self.by_api_key
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populate from the store blob when the in-memory set is empty.
    pub fn load_from_store_if_empty(&self) -> LoadOutcome {
        if !self.is_empty() {
            return LoadOutcome::AlreadyPopulated;
        }
        let Some(store) = &self.store else {
            return LoadOutcome::Empty;
        };
        let section = match store.section(SECTION) {
            Ok(section) => section,
            Err(err) => {
                warn!(error = %err, "cannot read triggered limits from store");
                return LoadOutcome::Empty;
            }
        };
        let (Some(payload), Some(checksum)) =
            (section.get(PAYLOAD_KEY), section.get(CHECKSUM_KEY))
        else {
            return LoadOutcome::Empty;
        };
        if hex_sha256(payload.as_bytes()) != *checksum {
            warn!("triggered limits blob failed checksum verification, ignoring");
            return LoadOutcome::ChecksumMismatch;
        }
        let limits: Vec<TriggeredLimit> = match BASE64
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(limits) => limits,
            None => {
                warn!("triggered limits blob is unparseable, ignoring");
                return LoadOutcome::ChecksumMismatch;
            }
        };
        let count = limits.len();
        let mut index: HashMap<String, Vec<TriggeredLimit>> = HashMap::new();
        for limit in limits {
            index.entry(limit.api_key_id.clone()).or_default().push(limit);
        }
        *self
            .by_api_key
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = index;
        debug!(count, "triggered limits loaded from store");
        LoadOutcome::Loaded(count)
    }

    fn persist(&self, limits: &[TriggeredLimit]) -> Result<(), AicmError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let json = serde_json::to_vec(limits)
            .map_err(|e| AicmError::Internal(format!("cannot serialize limits: {e}")))?;
        let payload = BASE64.encode(&json);
        let checksum = hex_sha256(payload.as_bytes());
        let mut section = std::collections::BTreeMap::new();
        section.insert(PAYLOAD_KEY.to_string(), payload);
        section.insert(CHECKSUM_KEY.to_string(), checksum);
        store.replace_section(SECTION, section)
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
