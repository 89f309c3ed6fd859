//! Rate limiting logic and state management.

mod decision;
mod engine;
mod key;
mod policy;
mod sweep;

pub use decision::{Decision, RateLimitHeaders};
pub use engine::{ActionStats, EngineStats, KeySnapshot, LimitInfo, LimiterEngine};
pub use key::{LimitKey, DEFAULT_IDENTIFIER};
pub use policy::{Policy, PolicyTable};
pub use sweep::{Sweeper, DEFAULT_SWEEP_PERIOD};
