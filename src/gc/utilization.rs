//! Per-file accounting of free bytes.
//!
//! Every commit reports the pages (and the database root) it superseded.
//! Their bytes are added to the free counter of the file they live in, and
//! the exact range is remembered so that the cleaner can skip a loggable
//! without loading the tree it belongs to. Only the counters are persisted:
//! after a restart the ranges are unknown and every loggable is treated as
//! possibly live.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::GcConfig;
use crate::env::EnvironmentInner;
use crate::error::Result;
use crate::log::{Address, Log, Loggable};
use crate::Error;

/// Name of the store the profile is persisted in.
pub const UTILIZATION_STORE: &str = "ashlog.gc.up";

/// Persisted record of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUtilization {
    pub free_bytes: u64,
}

#[derive(Debug, Default)]
struct FileStats {
    free: u64,
    /// address -> length of every loggable known to be superseded
    expired: BTreeMap<Address, u64>,
}

pub struct UtilizationProfile {
    log: Arc<Log>,
    max_free_percent: u8,
    file_min_age: usize,
    files: Mutex<HashMap<Address, FileStats>>,
}

impl UtilizationProfile {
    pub fn new(log: Arc<Log>, config: &GcConfig) -> Self {
        Self {
            log,
            max_free_percent: config.max_free_space_percent(),
            file_min_age: config.file_min_age,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Accounts superseded `(address, length)` ranges.
    pub fn fetch_expired(&self, expired: &[(Address, u64)]) -> Result<()> {
        let mut files = self.files.lock()?;
        for &(address, length) in expired {
            let file = self.log.file_address(address);
            if self.log.file_size(file) == 0 {
                continue;
            }
            let stats = files.entry(file).or_default();
            if stats.expired.insert(address, length).is_none() {
                stats.free += length;
            }
        }
        Ok(())
    }

    pub fn is_expired(&self, address: Address, length: u64) -> bool {
        let file = self.log.file_address(address);
        self.files
            .lock()
            .ok()
            .and_then(|files| {
                files
                    .get(&file)
                    .map(|stats| stats.expired.get(&address) == Some(&length))
            })
            .unwrap_or(false)
    }

    pub fn is_loggable_expired(&self, loggable: &Loggable) -> bool {
        self.is_expired(loggable.address, loggable.length())
    }

    pub fn file_free_bytes(&self, file: Address) -> u64 {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(&file).map(|stats| stats.free))
            .unwrap_or(0)
    }

    /// Free bytes over the bytes of all files, in percent.
    pub fn total_free_space_percent(&self) -> u64 {
        let total = self.log.disk_usage();
        if total == 0 {
            return 0;
        }
        let free: u64 = match self.files.lock() {
            Ok(files) => files.values().map(|stats| stats.free).sum(),
            Err(_) => return 0,
        };
        free.min(total) * 100 / total
    }

    /// Files worth cleaning, most free space first. The tail and the newest
    /// `file_min_age` files are never returned, nor files `skip` rejects.
    pub fn files_sorted_by_utilization(&self, skip: impl Fn(Address) -> bool) -> Vec<Address> {
        let addresses = self.log.file_addresses();
        let candidates = addresses.len().saturating_sub(self.file_min_age.max(1));
        let Ok(files) = self.files.lock() else {
            return Vec::new();
        };

        addresses[..candidates]
            .iter()
            .copied()
            .filter(|file| !skip(*file))
            .filter_map(|file| {
                let total = self.log.file_size(file);
                let free = files.get(&file).map_or(0, |stats| stats.free).min(total);
                (total > 0 && free * 100 > total * self.max_free_percent as u64)
                    .then_some((file, free, total))
            })
            .sorted_by(|(a, a_free, a_total), (b, b_free, b_total)| {
                // higher free ratio first: b_free / b_total vs a_free / a_total
                (*b_free as u128 * *a_total as u128)
                    .cmp(&(*a_free as u128 * *b_total as u128))
                    .then(a.cmp(b))
            })
            .map(|(file, _, _)| file)
            .collect()
    }

    pub fn remove_file(&self, file: Address) -> Result<()> {
        self.files.lock()?.remove(&file);
        Ok(())
    }

    /// Drops files the log no longer has and caps every counter at the size
    /// of its file. Returns the free bytes left.
    pub fn estimate_total_bytes(&self) -> Result<u64> {
        let mut files = self.files.lock()?;
        files.retain(|file, _| self.log.file_size(*file) > 0);
        let mut free = 0;
        for (file, stats) in files.iter_mut() {
            stats.free = stats.free.min(self.log.file_size(*file));
            free += stats.free;
        }
        tracing::debug!(
            files = files.len(),
            free_bytes = free,
            disk_usage = self.log.disk_usage(),
            "Estimated total bytes"
        );
        Ok(free)
    }

    /// Live bytes per file: size minus free.
    pub fn live_bytes(&self) -> Result<BTreeMap<Address, u64>> {
        let files = self.files.lock()?;
        Ok(self
            .log
            .file_addresses()
            .into_iter()
            .map(|file| {
                let free = files.get(&file).map_or(0, |stats| stats.free);
                (file, self.log.file_size(file).saturating_sub(free))
            })
            .collect())
    }

    /// Counters of every log file, files without expirations included.
    fn snapshot(&self) -> Result<Vec<(Address, FileUtilization)>> {
        let files = self.files.lock()?;
        Ok(self
            .log
            .file_addresses()
            .into_iter()
            .map(|file| {
                let free_bytes = files.get(&file).map_or(0, |stats| stats.free);
                (file, FileUtilization { free_bytes })
            })
            .collect())
    }

    /// Persists the counters in [`UTILIZATION_STORE`].
    pub(crate) fn save(&self, env: &Arc<EnvironmentInner>) -> Result<()> {
        let entries = self.snapshot()?;
        env.execute_in_transaction(|txn| {
            let store = txn.open_store(UTILIZATION_STORE, false)?;
            let stale: Vec<Vec<u8>> = txn
                .scan(&store)?
                .into_iter()
                .map(|(key, _)| key)
                .filter(|key| {
                    decode_key(key).map_or(true, |file| {
                        entries.binary_search_by_key(&file, |(f, _)| *f).is_err()
                    })
                })
                .collect();
            for key in stale {
                txn.delete(&store, &key)?;
            }
            for (file, utilization) in &entries {
                let value = crate::encoding::bincode::serialize(utilization)?;
                txn.put(&store, &file.to_be_bytes(), &value)?;
            }
            Ok(())
        })?;
        tracing::debug!(files = entries.len(), "Saved utilization profile");
        Ok(())
    }

    /// Loads the persisted counters, or rebuilds them from the trees
    /// reachable from the current snapshot if nothing was persisted. Files
    /// the persisted profile does not know, written after it was saved by a
    /// process that did not close cleanly, are recomputed the same way.
    pub(crate) fn load(&self, env: &Arc<EnvironmentInner>) -> Result<()> {
        let saved = env.begin_read_only_transaction().and_then(|txn| {
            match txn.find_store(UTILIZATION_STORE)? {
                Some(store) => txn.scan(&store).map(Some),
                None => Ok(None),
            }
        })?;

        let Some(entries) = saved else {
            return self.rebuild(env);
        };

        let missing = {
            let mut files = self.files.lock()?;
            files.clear();
            for (key, value) in entries {
                let file = decode_key(&key)?;
                let utilization: FileUtilization = crate::encoding::bincode::deserialize(&value)?;
                if self.log.file_size(file) > 0 {
                    files.entry(file).or_default().free = utilization.free_bytes;
                }
            }
            tracing::debug!(files = files.len(), "Loaded utilization profile");
            self.log
                .file_addresses()
                .into_iter()
                .filter(|file| !files.contains_key(file))
                .collect_vec()
        };
        if !missing.is_empty() {
            self.recompute(env, &missing)?;
            tracing::info!(files = missing.len(), "Recomputed files missing from the utilization profile");
        }
        Ok(())
    }

    /// Recomputes every counter as file size minus the bytes reachable from
    /// the current snapshot.
    pub(crate) fn rebuild(&self, env: &EnvironmentInner) -> Result<()> {
        self.files.lock()?.clear();
        let targets = self.log.file_addresses();
        self.recompute(env, &targets)?;
        tracing::info!(files = targets.len(), "Rebuilt utilization profile");
        Ok(())
    }

    fn recompute(&self, env: &EnvironmentInner, targets: &[Address]) -> Result<()> {
        let mut live: HashMap<Address, u64> = HashMap::new();
        env.visit_reachable(&mut |address, length| {
            *live.entry(self.log.file_address(address)).or_default() += length;
        })?;

        let mut files = self.files.lock()?;
        for &file in targets {
            let size = self.log.file_size(file);
            let used = live.get(&file).copied().unwrap_or(0);
            files.entry(file).or_default().free = size.saturating_sub(used);
        }
        Ok(())
    }
}

fn decode_key(key: &[u8]) -> Result<Address> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| {
        Error::StructureCorruption(format!("Utilization key of {} bytes", key.len()))
    })?;
    Ok(Address::from_be_bytes(bytes))
}

impl std::fmt::Debug for UtilizationProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilizationProfile")
            .field("max_free_percent", &self.max_free_percent)
            .field("file_min_age", &self.file_min_age)
            .finish()
    }
}
