//! Environments: a log, the trees stored in it and the collector keeping it
//! compact.
//!
//! The state a transaction starts from is published as one [`MetaState`]:
//! the meta tree (store name to store root) and the database root loggable
//! it was committed with. Readers pin a state by holding it and are never
//! blocked. Commits are serialized by a single lock and validated
//! optimistically: a transaction that did not start from the latest state
//! fails with [`Error::ConcurrencyConflict`] and nothing it wrote is
//! published.
//!
//! ```text
//!   commit n-1                 commit n
//!  [pages][meta][root n-1] ... [pages][meta][root n]   <- high address
//!                    ^ expired by commit n
//! ```

pub mod meta;
mod safe_tasks;
pub mod transaction;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::config::EnvironmentConfig;
use crate::error::Result;
use crate::flock::{FileLock, LOCK_FILE};
use crate::gc::GarbageCollector;
use crate::log::loggable::{DATABASE_ROOT, FIRST_USER_STRUCTURE_ID, META_TREE_ID};
use crate::log::{Address, Log};
use crate::scheduler::JobProcessor;
use crate::tree::{BTree, TreeContext};
use crate::Error;

use meta::{DatabaseRoot, MetaState, StoreMeta};
use safe_tasks::TransactionRegistry;

pub use transaction::{Store, Transaction};

pub(crate) struct EnvironmentInner {
    config: EnvironmentConfig,
    created: Instant,
    log: Arc<Log>,
    pub(crate) tree_context: TreeContext,
    current: RwLock<Arc<MetaState>>,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) registry: TransactionRegistry,
    pub(crate) gc: GarbageCollector,
    closed: AtomicBool,
    _lock: FileLock,
}

impl EnvironmentInner {
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub(crate) fn current(&self) -> Result<Arc<MetaState>> {
        Ok(self.current.read()?.clone())
    }

    pub(crate) fn publish(&self, state: Arc<MetaState>) -> Result<()> {
        *self.current.write()? = state;
        Ok(())
    }

    /// Calls `visit` with every loggable reachable from the current
    /// snapshot: the database root, the meta tree and every store.
    pub(crate) fn visit_reachable(&self, visit: &mut dyn FnMut(Address, u64)) -> Result<()> {
        let state = self.current()?;
        if let Some((address, length)) = state.root {
            visit(address, length);
        }
        state.meta.visit_pages(visit)?;
        for entry in state.meta.iter() {
            let (_, value) = entry?;
            let store = StoreMeta::decode(&value)?;
            BTree::load(
                self.tree_context.clone(),
                store.structure_id,
                store.duplicates,
                store.root_address,
            )?
            .visit_pages(visit)?;
        }
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("Environment is closed".to_string()));
        }
        Ok(())
    }

    pub fn begin_transaction(self: &Arc<Self>) -> Result<Transaction> {
        Transaction::begin(self.clone(), false)
    }

    pub fn begin_read_only_transaction(self: &Arc<Self>) -> Result<Transaction> {
        Transaction::begin(self.clone(), true)
    }

    pub fn execute_in_transaction<T>(
        self: &Arc<Self>,
        mut f: impl FnMut(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        loop {
            let mut txn = self.begin_transaction()?;
            let result = f(&mut txn)?;
            match txn.commit() {
                Ok(()) => return Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, "Retrying transaction");
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn execute_transaction_safe_task(&self, task: impl FnOnce() + Send + 'static) {
        self.registry.execute(Box::new(task));
    }

    /// Durability barrier: everything committed so far is on disk when this
    /// returns.
    pub fn flush_and_sync(&self) -> Result<()> {
        let _guard = self.commit_lock.lock()?;
        self.log.flush()?;
        self.log.sync()
    }

    fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.gc.finish();
        if self.config.gc.enabled {
            self.gc.utilization_profile().save(self)?;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.flush_and_sync()?;
        tracing::info!(dir = ?self.log.location(), "Closed environment");
        Ok(())
    }
}

/// An open environment.
///
/// ```no_run
/// use ashlog::{Environment, EnvironmentConfig};
///
/// let env = Environment::open(EnvironmentConfig::new("/tmp/ashlog"))?;
/// env.execute_in_transaction(|txn| {
///     let users = txn.open_store("users", false)?;
///     txn.put(&users, b"alice", b"admin")?;
///     Ok(())
/// })?;
/// env.close()?;
/// # Ok::<(), ashlog::Error>(())
/// ```
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    pub fn open(config: EnvironmentConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        let (log, root) = Log::open(&config.dir, &config.log)?;
        let log = Arc::new(log);
        let tree_context = TreeContext::new(
            log.clone(),
            config.page_cache_size,
            config.tree_max_page_size,
        );

        let state = match root {
            Some(loggable) if loggable.type_id == DATABASE_ROOT => {
                let root = DatabaseRoot::decode(&loggable)?;
                MetaState {
                    meta: BTree::load(tree_context.clone(), META_TREE_ID, false, root.meta_root)?,
                    root: Some((loggable.address, loggable.length())),
                    txn_id: root.txn_id,
                    next_structure_id: root.next_structure_id,
                }
            }
            Some(loggable) => {
                return Err(Error::CorruptedLog(format!(
                    "Expected a database root at address {}, found type {}",
                    loggable.address, loggable.type_id
                )))
            }
            None => MetaState {
                meta: BTree::empty(tree_context.clone(), META_TREE_ID, false),
                root: None,
                txn_id: 0,
                next_structure_id: FIRST_USER_STRUCTURE_ID,
            },
        };

        let processor = JobProcessor::start("ashlog-cleaner")?;
        let inner = Arc::new_cyclic(|weak| EnvironmentInner {
            gc: GarbageCollector::new(weak.clone(), config.gc.clone(), log.clone(), processor),
            config,
            created: Instant::now(),
            log: log.clone(),
            tree_context,
            current: RwLock::new(Arc::new(state)),
            commit_lock: Mutex::new(()),
            registry: TransactionRegistry::new(),
            closed: AtomicBool::new(false),
            _lock: lock,
        });

        let weak = Arc::downgrade(&inner);
        log.add_new_file_listener(Box::new(move |file: Address| {
            if let Some(env) = weak.upgrade() {
                env.gc.on_new_file(file);
            }
        }))?;

        if inner.config.gc.enabled {
            inner.gc.utilization_profile().load(&inner)?;
        }
        inner.gc.start(&inner);

        tracing::info!(
            dir = ?inner.log.location(),
            files = inner.log.number_of_files(),
            high_address = inner.log.high_address(),
            "Opened environment"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        self.inner.config()
    }

    pub fn location(&self) -> &Path {
        self.inner.log.location()
    }

    pub fn log(&self) -> &Arc<Log> {
        self.inner.log()
    }

    pub fn gc(&self) -> &GarbageCollector {
        &self.inner.gc
    }

    pub fn begin_transaction(&self) -> Result<Transaction> {
        self.inner.begin_transaction()
    }

    pub fn begin_read_only_transaction(&self) -> Result<Transaction> {
        self.inner.begin_read_only_transaction()
    }

    /// Runs `f` in a transaction and commits it, starting over while the
    /// commit conflicts with concurrent ones.
    pub fn execute_in_transaction<T>(
        &self,
        f: impl FnMut(&mut Transaction) -> Result<T>,
    ) -> Result<T> {
        self.inner.execute_in_transaction(f)
    }

    pub fn compute_in_read_only_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T>,
    ) -> Result<T> {
        let txn = self.begin_read_only_transaction()?;
        f(&txn)
    }

    /// Runs `task` once every transaction begun before this call has
    /// finished.
    pub fn execute_transaction_safe_task(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.execute_transaction_safe_task(task)
    }

    pub fn flush_and_sync(&self) -> Result<()> {
        self.inner.flush_and_sync()
    }

    /// Calls `visit` with address and length of every loggable reachable
    /// from the latest commit.
    pub fn visit_reachable(&self, visit: &mut dyn FnMut(Address, u64)) -> Result<()> {
        self.inner.visit_reachable(visit)
    }

    /// Id of the latest commit.
    pub fn last_txn_id(&self) -> Result<u64> {
        Ok(self.inner.current()?.txn_id)
    }

    /// Stops the collector, persists its profile and syncs the log.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<EnvironmentInner> {
        &self.inner
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::error!(error = %e, "Failed to close environment");
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("dir", &self.inner.config.dir)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{GcConfig, LogConfig};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Small files and pages, collector off.
    pub(crate) fn test_config(dir: &TempDir) -> EnvironmentConfig {
        EnvironmentConfig::new(dir.path())
            .log(LogConfig::default().file_length(16 * 1024))
            .tree_max_page_size(8)
            .page_cache_size(256)
            .gc(GcConfig::default().enabled(false))
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:05}", i).into_bytes()
    }

    #[test]
    fn test_put_get_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let env = Environment::open(test_config(&dir)).unwrap();
            env.execute_in_transaction(|txn| {
                let store = txn.open_store("users", false)?;
                for i in 0..100 {
                    txn.put(&store, &key(i), format!("value{}", i).as_bytes())?;
                }
                Ok(())
            })
            .unwrap();
            assert_eq!(env.last_txn_id().unwrap(), 1);
            env.close().unwrap();
        }

        let env = Environment::open(test_config(&dir)).unwrap();
        assert_eq!(env.last_txn_id().unwrap(), 1);
        env.compute_in_read_only_transaction(|txn| {
            let store = txn.find_store("users")?.expect("store exists");
            assert_eq!(txn.count(&store)?, 100);
            assert_eq!(txn.get(&store, &key(42))?, Some(b"value42".to_vec()));
            assert_eq!(txn.get(&store, b"missing")?, None);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_uncommitted_changes_are_lost() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        {
            let mut txn = env.begin_transaction().unwrap();
            let store = txn.open_store("users", false).unwrap();
            txn.put(&store, b"alice", b"admin").unwrap();
            assert_eq!(txn.get(&store, b"alice").unwrap(), Some(b"admin".to_vec()));
            txn.abort();
        }
        let txn = env.begin_read_only_transaction().unwrap();
        assert!(txn.find_store("users").unwrap().is_none());
        assert_eq!(env.log().high_address(), 0);
    }

    #[test]
    fn test_commit_conflict() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let store = env
            .execute_in_transaction(|txn| txn.open_store("counters", false))
            .unwrap();

        let mut first = env.begin_transaction().unwrap();
        let mut second = env.begin_transaction().unwrap();
        first.put(&store, b"n", b"1").unwrap();
        second.put(&store, b"n", b"2").unwrap();

        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(Error::ConcurrencyConflict)));
        assert!(!second.flush().unwrap());
        second.abort();

        let txn = env.begin_read_only_transaction().unwrap();
        assert_eq!(txn.get(&store, b"n").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let store = env
            .execute_in_transaction(|txn| {
                let store = txn.open_store("users", false)?;
                txn.put(&store, b"alice", b"v1")?;
                Ok(store)
            })
            .unwrap();

        let reader = env.begin_read_only_transaction().unwrap();
        env.execute_in_transaction(|txn| {
            txn.put(&store, b"alice", b"v2")?;
            txn.put(&store, b"bob", b"v1")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(reader.get(&store, b"alice").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(reader.get(&store, b"bob").unwrap(), None);
        let latest = env.begin_read_only_transaction().unwrap();
        assert_eq!(latest.get(&store, b"alice").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_read_only_transaction_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let store = env
            .execute_in_transaction(|txn| txn.open_store("users", false))
            .unwrap();

        let mut txn = env.begin_read_only_transaction().unwrap();
        assert!(txn.is_read_only());
        assert!(matches!(
            txn.put(&store, b"alice", b"admin"),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            txn.open_store("other", false),
            Err(Error::InvalidState(_))
        ));
        txn.commit().unwrap();
    }

    #[test]
    fn test_flush_keeps_transaction_open() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let mut txn = env.begin_transaction().unwrap();
        let store = txn.open_store("users", false).unwrap();
        txn.put(&store, b"alice", b"v1").unwrap();
        assert!(txn.flush().unwrap());
        assert_eq!(txn.snapshot_id(), 1);

        txn.put(&store, b"alice", b"v2").unwrap();
        txn.commit().unwrap();
        assert!(matches!(txn.get(&store, b"alice"), Err(Error::InvalidState(_))));
        assert_eq!(env.last_txn_id().unwrap(), 2);
    }

    #[test]
    fn test_duplicates_store() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        env.execute_in_transaction(|txn| {
            let tags = txn.open_store("tags", true)?;
            txn.put(&tags, b"rust", b"fast")?;
            txn.put(&tags, b"rust", b"safe")?;
            txn.put(&tags, b"go", b"simple")?;
            Ok(())
        })
        .unwrap();

        let mut txn = env.begin_transaction().unwrap();
        let tags = txn.open_store("tags", true).unwrap();
        assert!(tags.allows_duplicates());
        assert!(matches!(txn.open_store("tags", false), Err(Error::InvalidInput(_))));
        assert_eq!(
            txn.get_all(&tags, b"rust").unwrap(),
            vec![b"fast".to_vec(), b"safe".to_vec()]
        );
        assert!(txn.delete_pair(&tags, b"rust", b"fast").unwrap());
        assert_eq!(txn.get_all(&tags, b"rust").unwrap(), vec![b"safe".to_vec()]);
        assert!(txn.delete(&tags, b"go").unwrap());
        assert_eq!(txn.count(&tags).unwrap(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn test_store_names_and_range() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        env.execute_in_transaction(|txn| {
            let b = txn.open_store("b", false)?;
            txn.open_store("a", false)?;
            for i in 0..20 {
                txn.put(&b, &key(i), b"x")?;
            }
            // the uncommitted view answers ranges too
            let range = txn.range(&b, &key(5), &key(8))?;
            assert_eq!(range.len(), 3);
            Ok(())
        })
        .unwrap();

        let txn = env.begin_read_only_transaction().unwrap();
        assert_eq!(txn.store_names().unwrap(), vec!["a", "b"]);
        let b = txn.find_store("b").unwrap().unwrap();
        let range = txn.range(&b, &key(5), &key(8)).unwrap();
        let keys: Vec<_> = range.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![key(5), key(6), key(7)]);
        assert_eq!(txn.scan(&b).unwrap().len(), 20);
    }

    #[test]
    fn test_safe_task_waits_for_older_transactions() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let reader = env.begin_read_only_transaction().unwrap();
        {
            let ran = ran.clone();
            env.execute_transaction_safe_task(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        // a transaction begun after the task does not hold it back
        let later = env.begin_read_only_transaction().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        drop(reader);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        drop(later);

        let ran_now = ran.clone();
        env.execute_transaction_safe_task(move || {
            ran_now.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_directory_is_locked() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        assert!(matches!(
            Environment::open(test_config(&dir)),
            Err(Error::Locked(_))
        ));
        env.close().unwrap();
        assert!(Environment::open(test_config(&dir)).is_ok());
    }

    #[test]
    fn test_closed_environment_rejects_transactions() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let inner = env.inner.clone();
        env.close().unwrap();
        assert!(matches!(
            inner.begin_transaction(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_large_values_fit_into_files() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir)
            .log(LogConfig::default().file_length(64 * 1024))
            .tree_max_page_size(32);
        let env = Environment::open(config).unwrap();
        let store = env
            .execute_in_transaction(|txn| txn.open_store("blobs", false))
            .unwrap();
        env.execute_in_transaction(|txn| {
            for i in 0..20u32 {
                txn.put(&store, &key(i), &vec![i as u8; 4000])?;
            }
            Ok(())
        })
        .unwrap();

        assert!(env.log().number_of_files() >= 2);
        let values = env
            .compute_in_read_only_transaction(|txn| txn.scan(&store))
            .unwrap();
        assert_eq!(values.len(), 20);
        for (i, (_, value)) in values.iter().enumerate() {
            assert_eq!(value, &vec![i as u8; 4000]);
        }
    }

    #[test]
    fn test_every_commit_expires_the_previous_root() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(test_config(&dir)).unwrap();
        let store = env
            .execute_in_transaction(|txn| txn.open_store("users", false))
            .unwrap();
        let first_root = env.inner.current().unwrap().root.unwrap();
        env.execute_in_transaction(|txn| txn.put(&store, b"alice", b"admin"))
            .unwrap();

        let up = env.gc().utilization_profile();
        assert!(up.is_expired(first_root.0, first_root.1));
        let current = env.inner.current().unwrap().root.unwrap();
        assert!(!up.is_expired(current.0, current.1));
    }
}
