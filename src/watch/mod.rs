//! Change detection: watch rules, classification, debouncing and the
//! filesystem watcher that feeds them.

pub mod debounce;
pub mod rules;
pub mod types;
pub mod watcher;

pub use debounce::{BatchAccumulator, Debouncer, DEFAULT_WINDOW};
pub use rules::{RuleSet, Scope, WatchRule, DEFAULT_IGNORE_PATTERNS};
pub use types::{ChangeBatch, ChangeEvent, ChangeKind, Classification, ReloadKind};
pub use watcher::{FileWatcher, EVENT_QUEUE_CAPACITY};
