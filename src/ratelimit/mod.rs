//! Throttle buckets, counter storage and the fixed-window engine.

mod backend;
mod counter;
mod descriptor;
mod distributed;
mod limiter;
mod rules;

pub use backend::CounterStore;
pub use counter::{epoch_secs, FixedWindow, MemoryCounterStore};
pub use descriptor::{CounterKey, KeyScope};
pub use distributed::RedisCounterStore;
pub use limiter::{ThrottleEngine, ThrottleOutcome, ThrottledInfo, DEFAULT_STORE_TIMEOUT};
pub use rules::{Discriminator, ThrottleRule};
