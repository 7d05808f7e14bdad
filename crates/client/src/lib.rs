//! Keeps an application registered with Eureka-style service-discovery
//! registries for as long as the process runs.
//!
//! Per registry endpoint the agent builds a [`registration::RegistrationClient`]
//! on top of a pooled [`transport::RestClient`], drives it with a
//! [`supervisor::Supervisor`] task (register, then keep-alive every interval,
//! restarting after failures), and removes the instance on shutdown through a
//! [`shutdown::ShutdownGuard`].

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod agent;
pub mod config;
pub mod identity;
pub mod metadata;
pub mod registration;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use agent::{Agent, AgentError};
pub use config::{Config, ConfigError};
pub use registration::{Deregister, Lifecycle, RegistrationClient, RegistrationError};
pub use shutdown::{shutdown_signal, ShutdownGuard, ShutdownOutcome};
pub use supervisor::Supervisor;
pub use transport::{RestClient, Transport, TransportError};
