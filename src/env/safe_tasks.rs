//! Deferring work until older transactions are gone.
//!
//! Every transaction takes a ticket when it begins. A task registered now
//! is tagged with the next ticket to be handed out and runs once no active
//! ticket is below that tag, i.e. once every transaction that could still
//! see the state before the task was registered has finished.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_skiplist::SkipSet;

pub type SafeTask = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct TransactionRegistry {
    next_ticket: AtomicU64,
    active: SkipSet<u64>,
    tasks: Mutex<Vec<(u64, SafeTask)>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a beginning transaction. Its snapshot must be taken after
    /// this returns.
    pub fn register(&self) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.active.insert(ticket);
        ticket
    }

    pub fn unregister(&self, ticket: u64) {
        self.active.remove(&ticket);
        self.run_ready();
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Runs `task` now if no transaction is active, otherwise once all
    /// currently active ones have finished.
    pub fn execute(&self, task: SafeTask) {
        let horizon = self.next_ticket.load(Ordering::SeqCst);
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push((horizon, task)),
            // nobody can run the queue anymore, run in place
            Err(_) => {
                task();
                return;
            }
        }
        self.run_ready();
    }

    fn run_ready(&self) {
        let oldest = self.active.front().map(|entry| *entry.value());
        let ready: Vec<SafeTask> = {
            let Ok(mut tasks) = self.tasks.lock() else {
                return;
            };
            let (ready, waiting): (Vec<_>, Vec<_>) = mem::take(&mut *tasks)
                .into_iter()
                .partition(|(horizon, _)| oldest.map_or(true, |oldest| oldest >= *horizon));
            *tasks = waiting;
            ready.into_iter().map(|(_, task)| task).collect()
        };
        for task in ready {
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_task(counter: &Arc<AtomicUsize>) -> SafeTask {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_runs_immediately_without_transactions() {
        let registry = TransactionRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.execute(counting_task(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waits_for_older_transactions() {
        let registry = TransactionRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = registry.register();
        let second = registry.register();
        registry.execute(counting_task(&counter));

        // younger transactions do not hold the task back
        let third = registry.register();

        registry.unregister(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        registry.unregister(first);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.unregister(third);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(registry.active_count(), 0);
    }
}
