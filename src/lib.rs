//! Runtime agent bridging MCP clients to a fleet of tool-providing
//! subprocesses and peer runtimes, coordinated through a message bus.
//!
//! The binary runs in one of four operational modes decided at startup from
//! the environment; each mode composes a subset of the services in here. See
//! [`config::RuntimeMode`] for the mode table and [`coordinator::Coordinator`]
//! for the composition and lifecycle.

pub mod auth;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod messaging;
pub mod ratelimit;
pub mod server;
pub mod surface;
pub mod tools;
pub mod types;

pub use auth::{AuthService, Identity};
pub use cache::{CacheBucket, CacheService};
pub use config::{Credential, RuntimeConfig, RuntimeMode};
pub use coordinator::Coordinator;
pub use error::AgentError;
pub use messaging::BusClient;
pub use surface::SkillSurface;
pub use tools::{ToolDescriptor, ToolService};
