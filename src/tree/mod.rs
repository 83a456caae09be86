//! Copy-on-write B+tree stored in the log.
//!
//! A tree is identified by the address of its root loggable. Snapshots
//! ([`BTree`]) are immutable: they share pages with every other version and
//! are never modified. Writers work on a [`BTreeMutable`] overlay which copies
//! only the pages on the path to what it changes. Saving the overlay appends
//! the copied pages bottom-up, the root last, and reports every loggable the
//! new version no longer references as expired.
//!
//! ```text
//!              root v1                 root v2
//!             /      \                /      \
//!        leaf A     leaf B  <----- (shared)   leaf B'
//! ```
//!
//! Entries live in leaves only. Trees with duplicates keep several values per
//! key, ordered by (key, value).

pub mod cache;
pub mod mutable;
pub mod page;

use std::sync::Arc;

use crate::encoding::varint::MAX_VARINT_LEN;
use crate::error::Result;
use crate::log::loggable::{BOTTOM_ROOT, INTERNAL, INTERNAL_ROOT, LEAF, OVERHEAD};
use crate::log::{Address, Log, NULL_ADDRESS};
use crate::Error;

pub use cache::PageCache;
pub use mutable::BTreeMutable;
pub use page::{Entry, LoadedPage, Page};

/// Lower bound of all values of a key.
pub(crate) const NO_VALUE: &[u8] = &[];

/// What every tree of an environment shares: the log, the page cache and the
/// page split thresholds.
#[derive(Clone)]
pub struct TreeContext {
    log: Arc<Log>,
    cache: Option<Arc<PageCache>>,
    max_page_size: usize,
}

impl TreeContext {
    pub fn new(log: Arc<Log>, page_cache_size: usize, max_page_size: usize) -> Self {
        let cache = (page_cache_size > 0).then(|| Arc::new(PageCache::new(page_cache_size)));
        Self {
            log,
            cache,
            max_page_size,
        }
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    /// Bytes the entries of one page may take so that the page, framed as a
    /// root loggable, still fits into a log file.
    pub fn max_page_bytes(&self) -> usize {
        (self.log.file_length_bound() as usize).saturating_sub(OVERHEAD + 2 * MAX_VARINT_LEN)
    }

    pub fn cache(&self) -> Option<&Arc<PageCache>> {
        self.cache.as_ref()
    }

    /// Loads a non-root page of the tree `structure_id`.
    pub(crate) fn load_page(&self, structure_id: u32, address: Address) -> Result<Arc<LoadedPage>> {
        if let Some(page) = self.cache.as_ref().and_then(|c| c.get(address)) {
            return Ok(page);
        }

        let loggable = self.log.read(address)?;
        if !matches!(loggable.type_id, LEAF | INTERNAL) {
            return Err(Error::StructureCorruption(format!(
                "Expected a tree page at address {}, found type {}",
                address, loggable.type_id
            )));
        }
        if loggable.structure_id != structure_id {
            return Err(Error::StructureCorruption(format!(
                "Page at address {} belongs to structure {}, not {}",
                address, loggable.structure_id, structure_id
            )));
        }

        let (page, _) = Page::decode(address, loggable.type_id, &loggable.data)?;
        let page = Arc::new(LoadedPage {
            address,
            length: loggable.length(),
            page,
        });
        if let Some(cache) = &self.cache {
            cache.insert(page.clone());
        }
        Ok(page)
    }
}

impl std::fmt::Debug for TreeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeContext")
            .field("max_page_size", &self.max_page_size)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

/// An immutable version of a tree.
#[derive(Clone, Debug)]
pub struct BTree {
    ctx: TreeContext,
    structure_id: u32,
    duplicates: bool,
    size: u64,
    root: Option<Arc<LoadedPage>>,
}

impl BTree {
    pub fn empty(ctx: TreeContext, structure_id: u32, duplicates: bool) -> Self {
        Self {
            ctx,
            structure_id,
            duplicates,
            size: 0,
            root: None,
        }
    }

    /// Loads the tree whose root loggable is at `root_address`.
    /// [`NULL_ADDRESS`] stands for the empty tree.
    pub fn load(
        ctx: TreeContext,
        structure_id: u32,
        duplicates: bool,
        root_address: Address,
    ) -> Result<Self> {
        if root_address == NULL_ADDRESS {
            return Ok(Self::empty(ctx, structure_id, duplicates));
        }

        let loggable = ctx.log.read(root_address)?;
        if !matches!(loggable.type_id, BOTTOM_ROOT | INTERNAL_ROOT) {
            return Err(Error::StructureCorruption(format!(
                "Unexpected root page type {} at address {}",
                loggable.type_id, root_address
            )));
        }
        if loggable.structure_id != structure_id {
            return Err(Error::StructureCorruption(format!(
                "Root at address {} belongs to structure {}, not {}",
                root_address, loggable.structure_id, structure_id
            )));
        }

        let (page, size) = Page::decode(root_address, loggable.type_id, &loggable.data)?;
        Ok(Self {
            ctx,
            structure_id,
            duplicates,
            size: size.unwrap_or(0),
            root: Some(Arc::new(LoadedPage {
                address: root_address,
                length: loggable.length(),
                page,
            })),
        })
    }

    pub fn structure_id(&self) -> u32 {
        self.structure_id
    }

    pub fn allows_duplicates(&self) -> bool {
        self.duplicates
    }

    /// Number of entries.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn root_address(&self) -> Address {
        self.root.as_ref().map_or(NULL_ADDRESS, |r| r.address)
    }

    pub(crate) fn root(&self) -> Option<&Arc<LoadedPage>> {
        self.root.as_ref()
    }

    pub(crate) fn context(&self) -> &TreeContext {
        &self.ctx
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.iter_from(key).next().transpose()? {
            Some((found, value)) if found == key => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut iter = TreeIter::seek(self, Some((key, value)));
        Ok(match iter.next().transpose()? {
            Some((k, v)) => k == key && v == value,
            None => false,
        })
    }

    /// All values stored under `key`, in order.
    pub fn get_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.iter_from(key)
            .take_while(|entry| matches!(entry, Ok((k, _)) if k == key) || entry.is_err())
            .map(|entry| entry.map(|(_, value)| value))
            .collect()
    }

    pub fn iter(&self) -> TreeIter<'_> {
        TreeIter::seek(self, None)
    }

    /// Entries from the first one whose key is not less than `key`.
    pub fn iter_from(&self, key: &[u8]) -> TreeIter<'_> {
        TreeIter::seek(self, Some((key, NO_VALUE)))
    }

    /// Entries with `start <= key < end`.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: &'a [u8],
    ) -> impl Iterator<Item = Result<Entry>> + 'a {
        self.iter_from(start)
            .take_while(move |entry| !matches!(entry, Ok((key, _)) if key.as_slice() >= end))
    }

    pub fn get_mutable_copy(&self) -> BTreeMutable {
        BTreeMutable::from_snapshot(self)
    }

    /// Calls `visit` with (address, length) of every page reachable from
    /// the root, the root included.
    pub fn visit_pages(&self, visit: &mut dyn FnMut(Address, u64)) -> Result<()> {
        if let Some(root) = &self.root {
            self.visit_page(root, visit)?;
        }
        Ok(())
    }

    fn visit_page(&self, page: &LoadedPage, visit: &mut dyn FnMut(Address, u64)) -> Result<()> {
        visit(page.address, page.length);
        if let Page::Internal(slots) = &page.page {
            for (_, child) in slots {
                let child = self.ctx.load_page(self.structure_id, *child)?;
                self.visit_page(&child, visit)?;
            }
        }
        Ok(())
    }
}

/// In-order iterator over a snapshot.
pub struct TreeIter<'a> {
    tree: &'a BTree,
    /// Pages from the root down with the next slot to visit in each.
    stack: Vec<(Arc<LoadedPage>, usize)>,
    error: Option<Error>,
    done: bool,
}

impl<'a> TreeIter<'a> {
    fn seek(tree: &'a BTree, target: Option<(&[u8], &[u8])>) -> Self {
        let mut iter = Self {
            tree,
            stack: Vec::new(),
            error: None,
            done: false,
        };
        if let Some(root) = &tree.root {
            if let Err(e) = iter.descend(root.clone(), target) {
                iter.error = Some(e);
            }
        }
        iter
    }

    /// Pushes the path from `page` to the leaf holding the first entry not
    /// less than `target`, or to the leftmost leaf.
    fn descend(&mut self, mut page: Arc<LoadedPage>, target: Option<(&[u8], &[u8])>) -> Result<()> {
        let duplicates = self.tree.duplicates;
        loop {
            match &page.page {
                Page::Leaf(entries) => {
                    let index = target.map_or(0, |t| page::lower_bound(duplicates, entries, t));
                    self.stack.push((page, index));
                    return Ok(());
                }
                Page::Internal(slots) => {
                    let index = target.map_or(0, |t| page::child_index(duplicates, slots, t));
                    let child = slots[index].1;
                    self.stack.push((page, index + 1));
                    page = self.tree.ctx.load_page(self.tree.structure_id, child)?;
                }
            }
        }
    }

    fn step(&mut self) -> Result<Option<Entry>> {
        loop {
            let Some((page, index)) = self.stack.last_mut() else {
                return Ok(None);
            };
            let next_child = match &page.page {
                Page::Leaf(entries) => {
                    if let Some(entry) = entries.get(*index) {
                        *index += 1;
                        return Ok(Some(entry.clone()));
                    }
                    None
                }
                Page::Internal(slots) => slots.get(*index).map(|(_, child)| {
                    *index += 1;
                    *child
                }),
            };
            match next_child {
                Some(child) => {
                    let child = self.tree.ctx.load_page(self.tree.structure_id, child)?;
                    self.descend(child, None)?;
                }
                None => {
                    self.stack.pop();
                }
            }
        }
    }
}

impl Iterator for TreeIter<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.error.take() {
            self.done = true;
            return Some(Err(e));
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::log::loggable::LoggableToWrite;
    use tempfile::TempDir;

    pub(crate) fn context(dir: &TempDir, max_page_size: usize) -> TreeContext {
        let config = LogConfig::default().file_length(64 * 1024);
        let (log, _) = Log::open(dir.path(), &config).unwrap();
        TreeContext::new(Arc::new(log), 64, max_page_size)
    }

    pub(crate) fn key(i: u32) -> Vec<u8> {
        format!("key{:05}", i).into_bytes()
    }

    pub(crate) fn build(ctx: &TreeContext, count: u32) -> BTree {
        let mut tree = BTree::empty(ctx.clone(), 2, false).get_mutable_copy();
        for i in 0..count {
            tree.put(&key(i), &i.to_be_bytes()).unwrap();
        }
        let root = tree.save().unwrap();
        BTree::load(ctx.clone(), 2, false, root).unwrap()
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 4);
        let tree = BTree::load(ctx, 2, false, NULL_ADDRESS).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root_address(), NULL_ADDRESS);
        assert_eq!(tree.get(b"a").unwrap(), None);
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn test_lookup_and_iteration() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 4);
        let tree = build(&ctx, 100);

        assert_eq!(tree.size(), 100);
        assert_eq!(tree.get(&key(42)).unwrap(), Some(42u32.to_be_bytes().to_vec()));
        assert!(tree.has_key(&key(99)).unwrap());
        assert!(!tree.has_key(b"key").unwrap());

        let keys: Vec<_> = tree.iter().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, (0..100).map(key).collect::<Vec<_>>());

        let from: Vec<_> = tree.iter_from(b"key00095").map(|e| e.unwrap().0).collect();
        assert_eq!(from, (95..100).map(key).collect::<Vec<_>>());

        let range: Vec<_> = tree
            .range(&key(10), &key(13))
            .map(|e| e.unwrap().0)
            .collect();
        assert_eq!(range, vec![key(10), key(11), key(12)]);
    }

    #[test]
    fn test_visit_pages_covers_tree() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 4);
        let tree = build(&ctx, 50);

        let mut pages = Vec::new();
        tree.visit_pages(&mut |address, length| pages.push((address, length)))
            .unwrap();

        // a bulk load writes every page once
        let written: Vec<_> = ctx
            .log()
            .iter_from(0)
            .map(|l| l.unwrap())
            .map(|l| (l.address, l.length()))
            .collect();
        pages.sort();
        assert_eq!(pages, written);
        assert_eq!(pages.last().unwrap().0, tree.root_address());
    }

    #[test]
    fn test_load_rejects_non_root() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 4);
        let page = Page::Leaf(vec![(b"a".to_vec(), b"1".to_vec())]).encode();
        let address = ctx
            .log()
            .append(LoggableToWrite::new(LEAF, 2, &page))
            .unwrap();

        assert!(matches!(
            BTree::load(ctx.clone(), 2, false, address),
            Err(Error::StructureCorruption(_))
        ));
    }

    #[test]
    fn test_load_rejects_foreign_structure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 4);
        let tree = build(&ctx, 3);
        assert!(matches!(
            BTree::load(ctx.clone(), 3, false, tree.root_address()),
            Err(Error::StructureCorruption(_))
        ));
    }
}
