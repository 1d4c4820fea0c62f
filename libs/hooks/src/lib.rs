//! # relayd-hooks
//!
//! Hook pipeline for the relayd proxy.
//!
//! ## Concepts
//!
//! - A **hook** is a named lifecycle or traffic event ([`HookName`])
//! - A **handler** is registered for a hook at a [`Priority`]
//! - A **payload** is a JSON object passed through the handlers in order
//! - A **verification policy** decides what happens when a handler returns a
//!   payload whose shape differs from what it was given
//!
//! The proxy engine only depends on the [`HookRunner`] seam, so tests can
//! substitute recording doubles and production code uses [`HookRegistry`].

mod error;
mod registry;
mod types;

pub use error::HookError;
pub use registry::{HookHandler, HookRegistry, HookRunner};
pub use types::*;
