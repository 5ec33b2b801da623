//! cinder-core: the request-routing core of the cinder proxy.
//!
//! Owns the message model (arena-allocated request/response pairs with
//! fragment bookkeeping), the hash functions and shard continuum used
//! for key routing, the backend connector-pool scheduler, and the SQL
//! rule-classifier seam.
//!
//! The connector pool follows the same shared-nothing shape as the rest
//! of the proxy: one task exclusively owns all scheduler state, jobs
//! arrive over an mpsc channel, and each job carries a oneshot sender
//! for its reply. Nothing here blocks.

pub mod continuum;
pub mod error;
pub mod hashkit;
pub mod message;
pub mod pool;
pub mod route;
pub mod rule;

pub use continuum::Continuum;
pub use error::RelayError;
pub use hashkit::HashKind;
pub use message::{Message, MessageArena, MsgId, QueueKind, Role};
pub use pool::{GroupConfig, HelperEvent, HelperTask, Job, JobOutcome, PoolHandle};
pub use route::route_key;
pub use rule::{RouteClass, RuleClassifier, StaticRules};
