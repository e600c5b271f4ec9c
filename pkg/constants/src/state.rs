//! State store / controller runtime constants.

/// Root of every object key in the state store.
pub const REGISTRY_PREFIX: &str = "/registry/";

/// Capacity of the in-memory watch event ring buffer.
pub const EVENT_LOG_CAPACITY: usize = 4096;

/// Delay before re-enqueueing a binding whose cluster or project does not
/// exist yet, in seconds.
pub const DEPENDENCY_REQUEUE_SECS: u64 = 10;

/// Delay before retrying a key whose handler returned an error, in seconds.
pub const ERROR_REQUEUE_SECS: u64 = 5;

/// Interval between full resyncs of every binding, in seconds.
pub const RESYNC_INTERVAL_SECS: u64 = 300;

/// Default number of reconcile workers.
pub const DEFAULT_WORKERS: usize = 4;
