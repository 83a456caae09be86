use std::collections::{HashMap, HashSet};
use std::iter::Peekable;
use std::sync::Arc;

use super::meta::{DatabaseRoot, MetaState, StoreMeta};
use super::EnvironmentInner;
use crate::error::Result;
use crate::log::loggable::{DATABASE_ROOT, META_TREE_ID, NO_STRUCTURE_ID};
use crate::log::{Address, Loggable, LoggableIterator, LoggableToWrite, NULL_ADDRESS};
use crate::tree::{BTree, BTreeMutable, Entry};
use crate::Error;

/// A named tree of an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    name: String,
    structure_id: u32,
    duplicates: bool,
}

impl Store {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn structure_id(&self) -> u32 {
        self.structure_id
    }

    pub fn allows_duplicates(&self) -> bool {
        self.duplicates
    }
}

enum TreeView<'a> {
    Mutable(&'a BTreeMutable),
    Snapshot(BTree),
}

/// A view of the environment as of one commit plus the changes made on top
/// of it. Dropping a transaction without committing aborts it.
pub struct Transaction {
    env: Arc<EnvironmentInner>,
    ticket: u64,
    snapshot: Arc<MetaState>,
    read_only: bool,
    meta: Option<BTreeMutable>,
    trees: HashMap<u32, (Store, BTreeMutable)>,
    /// Structure ids without a store, looked up while reclaiming.
    missing: HashSet<u32>,
    next_structure_id: u32,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(env: Arc<EnvironmentInner>, read_only: bool) -> Result<Self> {
        env.check_open()?;
        let ticket = env.registry.register();
        let snapshot = match env.current() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                env.registry.unregister(ticket);
                return Err(e);
            }
        };
        tracing::trace!(txn_id = snapshot.txn_id, read_only, "Began transaction");
        Ok(Self {
            next_structure_id: snapshot.next_structure_id,
            env,
            ticket,
            snapshot,
            read_only,
            meta: None,
            trees: HashMap::new(),
            missing: HashSet::new(),
            finished: false,
        })
    }

    /// A transaction whose commit rewrites the entire meta tree, so that
    /// every loggable of the meta tree can be ignored while cleaning.
    pub(crate) fn begin_with_cloned_meta_tree(env: Arc<EnvironmentInner>) -> Result<Self> {
        let mut txn = Self::begin(env, false)?;
        let mut meta = txn.snapshot.meta.get_mutable_copy();
        meta.clone_all_pages()?;
        txn.meta = Some(meta);
        Ok(txn)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Id of the commit this transaction started from.
    pub fn snapshot_id(&self) -> u64 {
        self.snapshot.txn_id
    }

    /// Opens the store `name`, creating it unless the transaction is read
    /// only. An existing store keeps its duplicates setting; asking for the
    /// other one is an error.
    pub fn open_store(&mut self, name: &str, duplicates: bool) -> Result<Store> {
        if let Some(store) = self.find_store(name)? {
            if store.duplicates != duplicates {
                return Err(Error::InvalidInput(format!(
                    "Store {} was created with duplicates = {}",
                    name, store.duplicates
                )));
            }
            return Ok(store);
        }
        self.check_writable()?;

        let store = Store {
            name: name.to_string(),
            structure_id: self.next_structure_id,
            duplicates,
        };
        self.next_structure_id += 1;

        let meta = StoreMeta {
            structure_id: store.structure_id,
            root_address: NULL_ADDRESS,
            duplicates,
        };
        self.meta_mut().put(name.as_bytes(), &meta.encode()?)?;
        let tree = BTree::empty(self.env.tree_context.clone(), store.structure_id, duplicates);
        self.trees
            .insert(store.structure_id, (store.clone(), tree.get_mutable_copy()));

        tracing::debug!(store = name, structure_id = store.structure_id, "Created store");
        Ok(store)
    }

    pub fn find_store(&self, name: &str) -> Result<Option<Store>> {
        Ok(self.store_meta(name)?.map(|meta| Store {
            name: name.to_string(),
            structure_id: meta.structure_id,
            duplicates: meta.duplicates,
        }))
    }

    /// Names of all stores, in order.
    pub fn store_names(&self) -> Result<Vec<String>> {
        self.meta_entries()?
            .into_iter()
            .map(|(name, _)| {
                String::from_utf8(name)
                    .map_err(|e| Error::StructureCorruption(format!("Store name: {}", e)))
            })
            .collect()
    }

    pub fn get(&self, store: &Store, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.view(store)? {
            TreeView::Mutable(tree) => tree.get(key),
            TreeView::Snapshot(tree) => tree.get(key),
        }
    }

    pub fn get_all(&self, store: &Store, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self.view(store)? {
            TreeView::Mutable(tree) => tree.get_all(key),
            TreeView::Snapshot(tree) => tree.get_all(key),
        }
    }

    pub fn has_key(&self, store: &Store, key: &[u8]) -> Result<bool> {
        Ok(self.get(store, key)?.is_some())
    }

    /// Number of entries in `store`.
    pub fn count(&self, store: &Store) -> Result<u64> {
        Ok(match self.view(store)? {
            TreeView::Mutable(tree) => tree.size(),
            TreeView::Snapshot(tree) => tree.size(),
        })
    }

    /// All entries of `store` in key order.
    pub fn scan(&self, store: &Store) -> Result<Vec<Entry>> {
        match self.view(store)? {
            TreeView::Mutable(tree) => tree.entries(),
            TreeView::Snapshot(tree) => tree.iter().collect(),
        }
    }

    /// Entries with `start <= key < end`.
    pub fn range(&self, store: &Store, start: &[u8], end: &[u8]) -> Result<Vec<Entry>> {
        match self.view(store)? {
            TreeView::Mutable(tree) => {
                let mut entries = Vec::new();
                tree.scan(Some(start), &mut |entry: &Entry| {
                    if entry.0.as_slice() >= end {
                        return false;
                    }
                    entries.push(entry.clone());
                    true
                })?;
                Ok(entries)
            }
            TreeView::Snapshot(tree) => tree.range(start, end).collect(),
        }
    }

    /// Upsert. In a store with duplicates the pair is added instead.
    /// Returns whether the store changed.
    pub fn put(&mut self, store: &Store, key: &[u8], value: &[u8]) -> Result<bool> {
        self.mutable(store)?.put(key, value)
    }

    /// Removes `key` with all its values.
    pub fn delete(&mut self, store: &Store, key: &[u8]) -> Result<bool> {
        self.mutable(store)?.delete(key)
    }

    pub fn delete_pair(&mut self, store: &Store, key: &[u8], value: &[u8]) -> Result<bool> {
        self.mutable(store)?.delete_pair(key, value)
    }

    pub fn is_modified(&self) -> bool {
        self.meta.as_ref().is_some_and(|meta| meta.is_modified())
            || self.trees.values().any(|(_, tree)| tree.is_modified())
    }

    /// Commits and ends the transaction. Fails with
    /// [`Error::ConcurrencyConflict`] if another transaction committed since
    /// this one began; the transaction is then left as it was.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_changes()?;
        self.finish();
        Ok(())
    }

    /// Commits and keeps the transaction going on top of the new state.
    /// Returns false instead of failing when another transaction committed
    /// first.
    pub fn flush(&mut self) -> Result<bool> {
        match self.commit_changes() {
            Ok(()) => Ok(true),
            Err(Error::ConcurrencyConflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn abort(mut self) {
        self.finish();
    }

    fn commit_changes(&mut self) -> Result<()> {
        self.check_unfinished()?;
        if !self.is_modified() {
            return Ok(());
        }
        self.check_writable()?;

        let env = self.env.clone();
        let _guard = env.commit_lock.lock()?;
        let current = env.current()?;
        if current.txn_id != self.snapshot.txn_id {
            tracing::debug!(
                txn_id = self.snapshot.txn_id,
                current = current.txn_id,
                "Transaction conflicts with a newer commit"
            );
            return Err(Error::ConcurrencyConflict);
        }

        let mut expired: Vec<(Address, u64)> = Vec::new();
        let mut meta = match self.meta.take() {
            Some(meta) => meta,
            None => self.snapshot.meta.get_mutable_copy(),
        };
        for (store, tree) in self.trees.values_mut() {
            if !tree.is_modified() {
                continue;
            }
            let root_address = tree.save()?;
            expired.extend(tree.take_expired());
            let record = StoreMeta {
                structure_id: store.structure_id,
                root_address,
                duplicates: store.duplicates,
            };
            meta.put(store.name.as_bytes(), &record.encode()?)?;
        }
        let meta_root = meta.save()?;
        expired.extend(meta.take_expired());

        let root = DatabaseRoot {
            meta_root,
            txn_id: current.txn_id + 1,
            next_structure_id: self.next_structure_id.max(current.next_structure_id),
        };
        let data = root.encode();
        let loggable = LoggableToWrite::new(DATABASE_ROOT, NO_STRUCTURE_ID, &data);
        let length = loggable.length();
        let log = env.log();
        let address = log.append(loggable)?;
        log.flush()?;
        if let Some(previous) = current.root {
            expired.push(previous);
        }

        let state = Arc::new(MetaState {
            meta: BTree::load(env.tree_context.clone(), META_TREE_ID, false, meta_root)?,
            root: Some((address, length)),
            txn_id: root.txn_id,
            next_structure_id: root.next_structure_id,
        });
        env.publish(state.clone())?;
        env.gc.fetch_expired(&expired)?;

        tracing::debug!(
            txn_id = root.txn_id,
            root = address,
            high_address = log.high_address(),
            expired = expired.len(),
            "Committed transaction"
        );

        self.snapshot = state;
        self.next_structure_id = root.next_structure_id;
        self.trees.clear();
        self.missing.clear();
        Ok(())
    }

    /// Hands a loggable of the file being cleaned (and the loggables of the
    /// same structure following it) to the store owning it.
    pub(crate) fn reclaim(
        &mut self,
        loggable: Loggable,
        rest: &mut Peekable<LoggableIterator<'_>>,
        bound: Address,
        is_expired: &dyn Fn(Address, u64) -> bool,
    ) -> Result<()> {
        let structure_id = loggable.structure_id;
        if !self.trees.contains_key(&structure_id) {
            if self.missing.contains(&structure_id) {
                return Ok(());
            }
            match self.store_by_structure_id(structure_id)? {
                Some(store) => {
                    self.mutable(&store)?;
                }
                None => {
                    tracing::debug!(structure_id, "No store owns the structure");
                    self.missing.insert(structure_id);
                    return Ok(());
                }
            }
        }
        match self.trees.get_mut(&structure_id) {
            Some((_, tree)) => tree.reclaim(loggable, rest, bound, is_expired),
            None => Ok(()),
        }
    }

    fn store_by_structure_id(&self, structure_id: u32) -> Result<Option<Store>> {
        for (name, value) in self.meta_entries()? {
            let meta = StoreMeta::decode(&value)?;
            if meta.structure_id == structure_id {
                let name = String::from_utf8(name)
                    .map_err(|e| Error::StructureCorruption(format!("Store name: {}", e)))?;
                return Ok(Some(Store {
                    name,
                    structure_id,
                    duplicates: meta.duplicates,
                }));
            }
        }
        Ok(None)
    }

    fn store_meta(&self, name: &str) -> Result<Option<StoreMeta>> {
        let value = match &self.meta {
            Some(meta) => meta.get(name.as_bytes())?,
            None => self.snapshot.meta.get(name.as_bytes())?,
        };
        value.map(|v| StoreMeta::decode(&v)).transpose()
    }

    fn meta_entries(&self) -> Result<Vec<Entry>> {
        match &self.meta {
            Some(meta) => meta.entries(),
            None => self.snapshot.meta.iter().collect(),
        }
    }

    fn meta_mut(&mut self) -> &mut BTreeMutable {
        let snapshot = &self.snapshot;
        self.meta
            .get_or_insert_with(|| snapshot.meta.get_mutable_copy())
    }

    fn load(&self, store: &Store) -> Result<BTree> {
        let root = self
            .store_meta(&store.name)?
            .map_or(NULL_ADDRESS, |meta| meta.root_address);
        BTree::load(
            self.env.tree_context.clone(),
            store.structure_id,
            store.duplicates,
            root,
        )
    }

    fn view(&self, store: &Store) -> Result<TreeView<'_>> {
        self.check_unfinished()?;
        Ok(match self.trees.get(&store.structure_id) {
            Some((_, tree)) => TreeView::Mutable(tree),
            None => TreeView::Snapshot(self.load(store)?),
        })
    }

    fn mutable(&mut self, store: &Store) -> Result<&mut BTreeMutable> {
        self.check_unfinished()?;
        self.check_writable()?;
        if !self.trees.contains_key(&store.structure_id) {
            let tree = self.load(store)?.get_mutable_copy();
            self.trees
                .insert(store.structure_id, (store.clone(), tree));
        }
        match self.trees.get_mut(&store.structure_id) {
            Some((_, tree)) => Ok(tree),
            None => Err(Error::InvalidState(format!(
                "Store {} is not open",
                store.name
            ))),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidState(
                "Read-only transaction cannot be modified".to_string(),
            ));
        }
        Ok(())
    }

    fn check_unfinished(&self) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidState("Transaction is finished".to_string()));
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.meta = None;
            self.trees.clear();
            self.env.registry.unregister(self.ticket);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("snapshot", &self.snapshot.txn_id)
            .field("read_only", &self.read_only)
            .field("finished", &self.finished)
            .finish()
    }
}
