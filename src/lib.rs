pub mod config;
pub mod encoding;
pub mod env;
pub mod error;
pub mod flock;
pub mod gc;
pub mod log;
pub mod scheduler;
pub mod tree;

pub use config::{EnvironmentConfig, GcConfig, LogConfig};
pub use env::{Environment, Store, Transaction};
pub use error::{Error, Result};
pub use gc::{GarbageCollector, GcState, UtilizationProfile};
pub use log::{Address, Log, Loggable, NULL_ADDRESS};
pub use tree::{BTree, BTreeMutable};
