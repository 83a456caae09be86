//! Shared cache of decoded tree pages.
//!
//! Pages are immutable once written and addresses are never reused, so
//! entries never go stale. Eviction follows S3-FIFO: new pages enter a small
//! probation queue, pages read again while there move to the main queue, and
//! keys evicted from probation are remembered in a ghost queue so a quick
//! second miss goes straight to main.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::page::LoadedPage;
use crate::log::Address;

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Entry {
    page: Arc<LoadedPage>,
    freq: u8,
}

struct Queues {
    max_small_size: usize,
    capacity: usize,
    /// new entries are added to this queue
    small: VecDeque<Address>,
    /// entries that have been read while on probation
    main: VecDeque<Address>,
    /// keys evicted from small before being read again
    ghost: VecDeque<Address>,
    ghost_keys: HashSet<Address>,
    entries: HashMap<Address, Entry>,
}

pub struct PageCache {
    queues: Mutex<Queues>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let max_small_size = (capacity / 10).max(1);
        Self {
            queues: Mutex::new(Queues {
                max_small_size,
                capacity,
                small: VecDeque::new(),
                main: VecDeque::new(),
                ghost: VecDeque::new(),
                ghost_keys: HashSet::new(),
                entries: HashMap::new(),
            }),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn get(&self, address: Address) -> Option<Arc<LoadedPage>> {
        // a poisoned cache only costs a reload
        let mut queues = self.queues.lock().ok()?;
        match queues.entries.get_mut(&address) {
            Some(entry) => {
                entry.freq = (entry.freq + 1).min(MAX_FREQUENCY_LIMIT);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.page.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, page: Arc<LoadedPage>) {
        let Ok(mut queues) = self.queues.lock() else {
            return;
        };
        if queues.capacity == 0 || queues.entries.contains_key(&page.address) {
            return;
        }
        while queues.entries.len() >= queues.capacity {
            queues.evict();
        }

        let address = page.address;
        queues.entries.insert(address, Entry { page, freq: 0 });
        if queues.ghost_keys.remove(&address) {
            queues.main.push_back(address);
        } else {
            queues.small.push_back(address);
        }
    }

    pub fn len(&self) -> usize {
        self.queues.lock().map(|q| q.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Queues {
    /// Removes exactly one entry.
    fn evict(&mut self) {
        if self.small.len() >= self.max_small_size || self.main.is_empty() {
            self.evict_small();
        } else {
            self.evict_main();
        }
    }

    fn evict_small(&mut self) {
        while let Some(address) = self.small.pop_front() {
            let freq = self.entries.get(&address).map_or(0, |e| e.freq);
            if freq > 0 {
                self.main.push_back(address);
            } else {
                self.entries.remove(&address);
                self.remember(address);
                return;
            }
        }
        self.evict_main();
    }

    fn evict_main(&mut self) {
        while let Some(address) = self.main.pop_front() {
            match self.entries.get_mut(&address) {
                Some(entry) if entry.freq > 0 => {
                    entry.freq -= 1;
                    self.main.push_back(address);
                }
                Some(_) => {
                    self.entries.remove(&address);
                    return;
                }
                None => {}
            }
        }
    }

    fn remember(&mut self, address: Address) {
        if self.ghost.len() >= self.capacity {
            if let Some(oldest) = self.ghost.pop_front() {
                self.ghost_keys.remove(&oldest);
            }
        }
        self.ghost.push_back(address);
        self.ghost_keys.insert(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::page::Page;

    fn page(address: Address) -> Arc<LoadedPage> {
        Arc::new(LoadedPage {
            address,
            length: 20,
            page: Page::Leaf(vec![(address.to_be_bytes().to_vec(), vec![])]),
        })
    }

    #[test]
    fn test_insert_and_get() {
        let cache = PageCache::new(2);
        cache.insert(page(0));
        cache.insert(page(100));

        assert_eq!(cache.get(0).unwrap().address, 0);
        assert_eq!(cache.get(100).unwrap().address, 100);
        assert!(cache.get(200).is_none());
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn test_capacity_is_respected() {
        let cache = PageCache::new(4);
        for address in 0..20 {
            cache.insert(page(address * 100));
            assert!(cache.len() <= 4);
        }
        assert_eq!(cache.len(), 4);
        assert!(cache.get(1900).is_some());
    }

    #[test]
    fn test_frequently_read_page_survives() {
        let cache = PageCache::new(4);
        cache.insert(page(0));
        assert!(cache.get(0).is_some());

        for address in 1..10 {
            cache.insert(page(address * 100));
            assert!(cache.get(0).is_some());
        }
        assert!(cache.get(100).is_none());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = PageCache::new(0);
        cache.insert(page(0));
        assert!(cache.is_empty());
        assert!(cache.get(0).is_none());
    }
}
