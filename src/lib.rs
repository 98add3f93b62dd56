//! Persistent state and coordination core for a project-scoped AI coding
//! assistant: an ambient instance scope, a hierarchical storage façade over
//! per-project/per-session SQLite databases, a schema-validated event bus,
//! a deadline-bounded retry controller for upstream LLM calls, and a
//! layered config façade.

pub mod bus;
pub mod config;
pub mod error;
pub mod instance;
pub mod lock;
pub mod retry;
pub mod storage;

pub use bus::{Bus, Event, EventDescriptor, Subscriber};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use instance::{Instance, Project};
pub use retry::{ApiError, Decision};
pub use storage::{Storage, StorageBackend, StorageKey};
