//! Rate limiting logic and counter storage.

mod backend;
mod counter;
mod gatekeeper;
mod key;
mod limiter;
mod policy;

pub use backend::{CounterStore, TimeoutStore};
pub use counter::MemoryStore;
pub use gatekeeper::Gatekeeper;
pub use key::{BucketKey, ClientIdentity, KeyMode, RequestIdentity};
pub use limiter::{Decision, Outcome, RateLimiter};
pub use policy::{Policy, PolicyRule, PolicySet};
