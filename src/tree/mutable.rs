//! Writable overlay of a tree snapshot.

use std::cmp::Ordering;
use std::iter::Peekable;
use std::mem;

use super::page::{self, compare, Entry, Page};
use super::{BTree, TreeContext, NO_VALUE};
use crate::error::Result;
use crate::log::loggable::{BOTTOM_ROOT, INTERNAL, INTERNAL_ROOT, LEAF};
use crate::log::{Address, Loggable, LoggableIterator, LoggableToWrite, NULL_ADDRESS};
use crate::Error;

/// A child reference: either a page already in the log or a copy being
/// modified in memory.
#[derive(Debug)]
enum Node {
    Stored(Address),
    Dirty(Box<DirtyPage>),
}

#[derive(Debug)]
enum DirtyPage {
    Leaf(Vec<Entry>),
    Internal(Vec<(Entry, Node)>),
}

impl DirtyPage {
    fn from_page(page: &Page) -> Self {
        match page {
            Page::Leaf(entries) => DirtyPage::Leaf(entries.clone()),
            Page::Internal(slots) => DirtyPage::Internal(
                slots
                    .iter()
                    .map(|(bound, child)| (bound.clone(), Node::Stored(*child)))
                    .collect(),
            ),
        }
    }

    fn len(&self) -> usize {
        match self {
            DirtyPage::Leaf(entries) => entries.len(),
            DirtyPage::Internal(slots) => slots.len(),
        }
    }

    fn first(&self) -> Option<&Entry> {
        match self {
            DirtyPage::Leaf(entries) => entries.first(),
            DirtyPage::Internal(slots) => slots.first().map(|(bound, _)| bound),
        }
    }

    fn entry_lens(&self) -> Vec<usize> {
        match self {
            DirtyPage::Leaf(entries) => entries
                .iter()
                .map(|(key, value)| page::encoded_entry_len((key, value), false))
                .collect(),
            DirtyPage::Internal(slots) => slots
                .iter()
                .map(|((key, value), _)| page::encoded_entry_len((key, value), true))
                .collect(),
        }
    }

    /// Moves what one page can't hold into new siblings. A page keeps at
    /// most `max_page_size` entries taking at most `max_page_bytes` bytes.
    /// Returns the siblings in key order with their lower bounds.
    fn split(
        &mut self,
        duplicates: bool,
        max_page_size: usize,
        max_page_bytes: usize,
    ) -> Vec<(Entry, Node)> {
        let lens = self.entry_lens();
        let bytes: usize = lens.iter().sum();
        let cuts = if bytes > max_page_bytes {
            pack(&lens, max_page_size, max_page_bytes)
        } else if lens.len() > max_page_size {
            vec![lens.len() / 2]
        } else {
            return Vec::new();
        };

        let mut siblings = Vec::with_capacity(cuts.len());
        for &cut in cuts.iter().rev() {
            let sibling = match self {
                DirtyPage::Leaf(entries) => {
                    let right = entries.split_off(cut);
                    (bound_of(duplicates, &right[0]), DirtyPage::Leaf(right))
                }
                DirtyPage::Internal(slots) => {
                    let right = slots.split_off(cut);
                    (bound_of(duplicates, &right[0].0), DirtyPage::Internal(right))
                }
            };
            siblings.push(sibling);
        }
        siblings.reverse();
        siblings
            .into_iter()
            .map(|(bound, page)| (bound, Node::Dirty(Box::new(page))))
            .collect()
    }
}

/// Lower bound of an internal slot starting at `entry`. Values only order
/// entries in trees with duplicates.
fn bound_of(duplicates: bool, entry: &Entry) -> Entry {
    if duplicates {
        entry.clone()
    } else {
        (entry.0.clone(), Vec::new())
    }
}

/// Greedy cut points splitting entries of the given encoded lengths into
/// runs of at most `max_len` entries and `max_bytes` bytes. A single entry
/// larger than `max_bytes` gets a run of its own.
fn pack(lens: &[usize], max_len: usize, max_bytes: usize) -> Vec<usize> {
    let mut cuts = Vec::new();
    let mut run_len = 0;
    let mut run_bytes = 0;
    for (i, &len) in lens.iter().enumerate() {
        if run_len > 0 && (run_len == max_len || run_bytes + len > max_bytes) {
            cuts.push(i);
            run_len = 0;
            run_bytes = 0;
        }
        run_len += 1;
        run_bytes += len;
    }
    cuts
}

/// Outcome of an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Put {
    Inserted,
    Replaced,
    Unchanged,
}

/// Path copying over the nodes of one tree.
struct Overlay<'a> {
    ctx: &'a TreeContext,
    structure_id: u32,
    duplicates: bool,
    expired: &'a mut Vec<(Address, u64)>,
}

impl Overlay<'_> {
    /// Makes `node` writable, copying a stored page and expiring its loggable.
    fn open<'n>(&mut self, node: &'n mut Node) -> Result<&'n mut DirtyPage> {
        if let Node::Stored(address) = *node {
            let loaded = self.ctx.load_page(self.structure_id, address)?;
            self.expired.push((address, loaded.length));
            *node = Node::Dirty(Box::new(DirtyPage::from_page(&loaded.page)));
        }
        match node {
            Node::Dirty(page) => Ok(&mut **page),
            Node::Stored(address) => Err(Error::InvalidState(format!(
                "Page at address {} was not copied",
                address
            ))),
        }
    }

    fn put(
        &mut self,
        node: &mut Node,
        entry: Entry,
        overwrite: bool,
    ) -> Result<(Put, Vec<(Entry, Node)>)> {
        let duplicates = self.duplicates;
        let max_page_size = self.ctx.max_page_size();
        let max_page_bytes = self.ctx.max_page_bytes();
        let page = self.open(node)?;

        let outcome = match page {
            DirtyPage::Leaf(entries) => {
                let found = entries.binary_search_by(|(key, value)| {
                    compare(duplicates, (key, value), (&entry.0, &entry.1))
                });
                match found {
                    Ok(_) if duplicates || !overwrite => Put::Unchanged,
                    Ok(index) if entries[index].1 == entry.1 => Put::Unchanged,
                    Ok(index) => {
                        entries[index].1 = entry.1;
                        Put::Replaced
                    }
                    Err(index) => {
                        entries.insert(index, entry);
                        Put::Inserted
                    }
                }
            }
            DirtyPage::Internal(slots) => {
                let index = page::child_index(duplicates, slots, (&entry.0, &entry.1));
                let (outcome, siblings) = self.put(&mut slots[index].1, entry, overwrite)?;
                slots.splice(index + 1..index + 1, siblings);
                outcome
            }
        };
        Ok((outcome, page.split(duplicates, max_page_size, max_page_bytes)))
    }

    fn open_all(&mut self, node: &mut Node) -> Result<()> {
        if let DirtyPage::Internal(slots) = self.open(node)? {
            for (_, child) in slots.iter_mut() {
                self.open_all(child)?;
            }
        }
        Ok(())
    }

    /// Removes the entry equal to `target`. Emptied pages are dropped by
    /// their parent.
    fn delete(&mut self, node: &mut Node, target: (&[u8], &[u8])) -> Result<bool> {
        let duplicates = self.duplicates;
        match self.open(node)? {
            DirtyPage::Leaf(entries) => {
                match entries.binary_search_by(|(key, value)| compare(duplicates, (key, value), target)) {
                    Ok(index) => {
                        entries.remove(index);
                        Ok(true)
                    }
                    Err(_) => Ok(false),
                }
            }
            DirtyPage::Internal(slots) => {
                let index = page::child_index(duplicates, slots, target);
                let deleted = self.delete(&mut slots[index].1, target)?;
                if matches!(&slots[index].1, Node::Dirty(child) if child.len() == 0) {
                    slots.remove(index);
                }
                Ok(deleted)
            }
        }
    }

    /// Appends the dirty pages below and including `node`, children first.
    fn save(&mut self, node: &mut Node) -> Result<Address> {
        let page = match node {
            Node::Stored(address) => return Ok(*address),
            Node::Dirty(page) => self.freeze(page)?,
        };
        let data = page.encode();
        let address = self.ctx.log().append(LoggableToWrite::new(
            page.type_id(false),
            self.structure_id,
            &data,
        ))?;
        *node = Node::Stored(address);
        Ok(address)
    }

    /// Saves the children of a dirty page and returns its stored form.
    fn freeze(&mut self, page: &mut DirtyPage) -> Result<Page> {
        match page {
            DirtyPage::Leaf(entries) => Ok(Page::Leaf(entries.clone())),
            DirtyPage::Internal(slots) => {
                let mut frozen = Vec::with_capacity(slots.len());
                for (bound, child) in slots.iter_mut() {
                    frozen.push((bound.clone(), self.save(child)?));
                }
                Ok(Page::Internal(frozen))
            }
        }
    }
}

/// A tree being modified by a transaction.
///
/// Reads see the writes made so far. Nothing reaches the log until
/// [`save`](Self::save).
#[derive(Debug)]
pub struct BTreeMutable {
    ctx: TreeContext,
    structure_id: u32,
    duplicates: bool,
    size: u64,
    root: Node,
    /// Root loggable of the version this overlay started from.
    origin: Option<(Address, u64)>,
    expired: Vec<(Address, u64)>,
    modified: bool,
}

impl BTreeMutable {
    pub(crate) fn from_snapshot(tree: &BTree) -> Self {
        let root = match tree.root() {
            Some(root) => DirtyPage::from_page(&root.page),
            None => DirtyPage::Leaf(Vec::new()),
        };
        Self {
            ctx: tree.context().clone(),
            structure_id: tree.structure_id(),
            duplicates: tree.allows_duplicates(),
            size: tree.size(),
            root: Node::Dirty(Box::new(root)),
            origin: tree.root().map(|r| (r.address, r.length)),
            expired: Vec::new(),
            modified: false,
        }
    }

    fn overlay(&mut self) -> (Overlay<'_>, &mut Node) {
        (
            Overlay {
                ctx: &self.ctx,
                structure_id: self.structure_id,
                duplicates: self.duplicates,
                expired: &mut self.expired,
            },
            &mut self.root,
        )
    }

    pub fn structure_id(&self) -> u32 {
        self.structure_id
    }

    pub fn allows_duplicates(&self) -> bool {
        self.duplicates
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Loggables the saved version no longer references.
    pub fn expired(&self) -> &[(Address, u64)] {
        &self.expired
    }

    pub fn take_expired(&mut self) -> Vec<(Address, u64)> {
        mem::take(&mut self.expired)
    }

    /// Copies every page so that saving rewrites the whole tree.
    pub fn clone_all_pages(&mut self) -> Result<()> {
        let (mut overlay, root) = self.overlay();
        overlay.open_all(root)?;
        self.modified = true;
        Ok(())
    }

    /// Stores `value` under `key`. Without duplicates an existing value is
    /// replaced; with duplicates the pair is added unless present. Returns
    /// whether the tree changed.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.insert(key, value, true)
    }

    /// Like [`put`](Self::put) but never replaces an existing value.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.insert(key, value, false)
    }

    /// Appends an entry that must sort after every entry of the tree.
    pub fn put_right(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if let Some((last_key, last_value)) = self.last()? {
            if compare(self.duplicates, (key, value), (&last_key, &last_value)) != Ordering::Greater {
                return Err(Error::InvalidInput(format!(
                    "Key {:?} does not sort after the last key {:?}",
                    key, last_key
                )));
            }
        }
        self.insert(key, value, false)
    }

    fn insert(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> Result<bool> {
        // the entry may end up as the bound of an internal slot
        let len = page::encoded_entry_len((key, value), true);
        if len > self.ctx.max_page_bytes() {
            return Err(Error::InvalidInput(format!(
                "Entry of {} bytes does not fit into a log file",
                len
            )));
        }
        let unchanged = if self.duplicates {
            self.has_pair(key, value)?
        } else {
            match self.get(key)? {
                Some(existing) => !overwrite || existing == value,
                None => false,
            }
        };
        if unchanged {
            return Ok(false);
        }

        let (mut overlay, root) = self.overlay();
        let (outcome, siblings) = overlay.put(root, (key.to_vec(), value.to_vec()), overwrite)?;
        if !siblings.is_empty() {
            let left = mem::replace(root, Node::Stored(NULL_ADDRESS));
            let bound = match &left {
                Node::Dirty(page) => page
                    .first()
                    .map_or_else(Entry::default, |first| bound_of(overlay.duplicates, first)),
                Node::Stored(_) => Entry::default(),
            };
            let mut slots = vec![(bound, left)];
            slots.extend(siblings);
            *root = Node::Dirty(Box::new(DirtyPage::Internal(slots)));
        }

        if outcome == Put::Inserted {
            self.size += 1;
        }
        self.modified |= outcome != Put::Unchanged;
        Ok(outcome != Put::Unchanged)
    }

    /// Removes `key` with all its values.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if !self.duplicates {
            return self.remove(key, NO_VALUE);
        }
        let values = self.get_all(key)?;
        for value in &values {
            self.remove(key, value)?;
        }
        Ok(!values.is_empty())
    }

    /// Removes a single (key, value) pair.
    pub fn delete_pair(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if !self.duplicates && self.get(key)?.as_deref() != Some(value) {
            return Ok(false);
        }
        self.remove(key, value)
    }

    fn remove(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let present = if self.duplicates {
            self.has_pair(key, value)?
        } else {
            self.get(key)?.is_some()
        };
        if !present {
            return Ok(false);
        }

        let (mut overlay, root) = self.overlay();
        let deleted = overlay.delete(root, (key, value))?;

        // collapse internal roots left with a single child
        loop {
            let child = match overlay.open(root)? {
                DirtyPage::Internal(slots) if slots.len() <= 1 => slots.pop(),
                _ => break,
            };
            *root = match child {
                Some((_, child)) => child,
                None => Node::Dirty(Box::new(DirtyPage::Leaf(Vec::new()))),
            };
        }

        if deleted {
            self.size -= 1;
            self.modified = true;
        }
        Ok(deleted)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut found = None;
        self.walk(&self.root, Some((key, NO_VALUE)), &mut |(k, v): &Entry| {
            if k.as_slice() == key {
                found = Some(v.clone());
            }
            false
        })?;
        Ok(found)
    }

    pub fn has_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn has_pair(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut found = false;
        self.walk(&self.root, Some((key, value)), &mut |(k, v): &Entry| {
            found = k.as_slice() == key && v.as_slice() == value;
            false
        })?;
        Ok(found)
    }

    pub fn get_all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        self.walk(&self.root, Some((key, NO_VALUE)), &mut |(k, v): &Entry| {
            if k.as_slice() != key {
                return false;
            }
            values.push(v.clone());
            true
        })?;
        Ok(values)
    }

    /// Entries from the first key not less than `from` while `visit`
    /// returns true.
    pub fn scan(&self, from: Option<&[u8]>, visit: &mut dyn FnMut(&Entry) -> bool) -> Result<()> {
        self.walk(&self.root, from.map(|key| (key, NO_VALUE)), visit)?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(self.size as usize);
        self.scan(None, &mut |entry: &Entry| {
            entries.push(entry.clone());
            true
        })?;
        Ok(entries)
    }

    fn last(&self) -> Result<Option<Entry>> {
        let mut node = &self.root;
        loop {
            match node {
                Node::Dirty(page) => match page.as_ref() {
                    DirtyPage::Leaf(entries) => return Ok(entries.last().cloned()),
                    DirtyPage::Internal(slots) => match slots.last() {
                        Some((_, child)) => node = child,
                        None => return Ok(None),
                    },
                },
                Node::Stored(address) => {
                    let mut address = *address;
                    loop {
                        let loaded = self.ctx.load_page(self.structure_id, address)?;
                        match &loaded.page {
                            Page::Leaf(entries) => return Ok(entries.last().cloned()),
                            Page::Internal(slots) => match slots.last() {
                                Some((_, child)) => address = *child,
                                None => return Ok(None),
                            },
                        }
                    }
                }
            }
        }
    }

    /// Visits entries in order starting at the lower bound of `target`.
    /// Returns false once `visit` asked to stop.
    fn walk(
        &self,
        node: &Node,
        target: Option<(&[u8], &[u8])>,
        visit: &mut dyn FnMut(&Entry) -> bool,
    ) -> Result<bool> {
        match node {
            Node::Stored(address) => {
                let loaded = self.ctx.load_page(self.structure_id, *address)?;
                match &loaded.page {
                    Page::Leaf(entries) => Ok(self.walk_entries(entries, target, visit)),
                    Page::Internal(slots) => {
                        let start = target.map_or(0, |t| page::child_index(self.duplicates, slots, t));
                        for (_, child) in &slots[start..] {
                            if !self.walk(&Node::Stored(*child), target, visit)? {
                                return Ok(false);
                            }
                        }
                        Ok(true)
                    }
                }
            }
            Node::Dirty(page) => match page.as_ref() {
                DirtyPage::Leaf(entries) => Ok(self.walk_entries(entries, target, visit)),
                DirtyPage::Internal(slots) => {
                    let start = target.map_or(0, |t| page::child_index(self.duplicates, slots, t));
                    for (_, child) in &slots[start..] {
                        if !self.walk(child, target, visit)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            },
        }
    }

    fn walk_entries(
        &self,
        entries: &[Entry],
        target: Option<(&[u8], &[u8])>,
        visit: &mut dyn FnMut(&Entry) -> bool,
    ) -> bool {
        let start = target.map_or(0, |t| page::lower_bound(self.duplicates, entries, t));
        entries[start..].iter().all(|entry| visit(entry))
    }

    /// Writes the modified pages and the new root. Returns the address of the
    /// root loggable, [`NULL_ADDRESS`] for an empty tree. The previous root
    /// joins the expired loggables.
    pub fn save(&mut self) -> Result<Address> {
        if !self.modified {
            return Ok(self.origin.map_or(NULL_ADDRESS, |(address, _)| address));
        }

        let structure_id = self.structure_id;
        let size = self.size;
        let (mut overlay, root) = self.overlay();
        let page = overlay.open(root)?;
        let frozen = overlay.freeze(page)?;

        let new_origin = if size == 0 {
            None
        } else {
            let data = frozen.encode_root(size);
            let loggable = LoggableToWrite::new(frozen.type_id(true), structure_id, &data);
            let length = loggable.length();
            let address = self.ctx.log().append(loggable)?;
            Some((address, length))
        };

        self.root = Node::Dirty(Box::new(DirtyPage::from_page(&frozen)));
        if let Some(origin) = mem::replace(&mut self.origin, new_origin) {
            self.expired.push(origin);
        }
        self.modified = false;
        Ok(self.origin.map_or(NULL_ADDRESS, |(address, _)| address))
    }

    /// Makes the tree rewrite `first` and the following loggables of the same
    /// tree below `bound`, if they are still part of it. Loggables for which
    /// `is_expired` holds are skipped without looking at the tree.
    pub fn reclaim(
        &mut self,
        first: Loggable,
        rest: &mut Peekable<LoggableIterator<'_>>,
        bound: Address,
        is_expired: &dyn Fn(Address, u64) -> bool,
    ) -> Result<()> {
        let structure_id = self.structure_id;
        self.reclaim_one(&first, is_expired)?;
        while let Some(next) = rest.next_if(|next| {
            matches!(next, Ok(l) if l.structure_id == structure_id
                && l.address < bound
                && l.is_tree_page())
        }) {
            self.reclaim_one(&next?, is_expired)?;
        }
        Ok(())
    }

    fn reclaim_one(
        &mut self,
        loggable: &Loggable,
        is_expired: &dyn Fn(Address, u64) -> bool,
    ) -> Result<()> {
        if is_expired(loggable.address, loggable.length()) {
            return Ok(());
        }
        match loggable.type_id {
            BOTTOM_ROOT | INTERNAL_ROOT => {
                if self.origin.map(|(address, _)| address) == Some(loggable.address) {
                    self.modified = true;
                }
            }
            LEAF | INTERNAL => {
                let (page, _) = Page::decode(loggable.address, loggable.type_id, &loggable.data)?;
                let Some((key, value)) = page.first().cloned() else {
                    return Ok(());
                };
                if let Some(path) = self.find_path(loggable.address, (&key, &value))? {
                    self.copy_path(&path)?;
                    self.modified = true;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Child indexes leading from the root to the stored page at `address`,
    /// following `first`, the smallest entry of that page.
    fn find_path(&self, address: Address, first: (&[u8], &[u8])) -> Result<Option<Vec<usize>>> {
        let mut path = Vec::new();
        let mut node = &self.root;
        loop {
            match node {
                Node::Dirty(page) => match page.as_ref() {
                    DirtyPage::Leaf(_) => return Ok(None),
                    DirtyPage::Internal(slots) => {
                        let index = page::child_index(self.duplicates, slots, first);
                        path.push(index);
                        node = &slots[index].1;
                    }
                },
                Node::Stored(stored) => {
                    let mut current = *stored;
                    loop {
                        if current == address {
                            return Ok(Some(path));
                        }
                        let loaded = self.ctx.load_page(self.structure_id, current)?;
                        match &loaded.page {
                            Page::Leaf(_) => return Ok(None),
                            Page::Internal(slots) => {
                                let index = page::child_index(self.duplicates, slots, first);
                                path.push(index);
                                current = slots[index].1;
                            }
                        }
                    }
                }
            }
        }
    }

    fn copy_path(&mut self, path: &[usize]) -> Result<()> {
        let (mut overlay, root) = self.overlay();
        let mut page = overlay.open(root)?;
        for &index in path {
            page = match page {
                DirtyPage::Internal(slots) => overlay.open(&mut slots[index].1)?,
                DirtyPage::Leaf(_) => {
                    return Err(Error::InvalidState("Path leads through a leaf".to_string()))
                }
            };
        }
        Ok(())
    }
}
