//! Multi-tab Copilot chat host.
//!
//! A [`control::CopilotHostControl`] owns a [`registry::TabRegistry`] of
//! independent [`session::Session`]s. Every activity crossing a session's
//! store runs through its [`pipeline::ActivityPipeline`], which hands dynamic
//! plan events to the [`plan::PlanRegistry`] and re-injects what it
//! synthesizes.

use std::future::Future;
use std::pin::Pin;

pub mod cli;
pub mod config;
pub mod connection;
pub mod control;
pub mod host;
pub mod http_connection;
pub mod identity;
pub mod pipeline;
pub mod plan;
pub mod readiness;
pub mod registry;
pub mod render;
pub mod router;
pub mod session;
pub mod store;
pub mod testing;
pub mod token_cache;
pub mod transcript;

pub use copilot_host_error::{ErrorType, HostError, ProblemDetails};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
