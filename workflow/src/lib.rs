/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! A priority task dispatcher coupled to a capacity-aware resource manager.
//!
//! Embed a [`WorkflowEngine`] directly; there is no wire protocol here, the
//! engine is a library used by a process that owns its own task definitions.

mod engine;
mod error;
mod resource;
mod task;

pub use engine::WorkflowEngine;
pub use error::{Error, WorkflowResult};
pub use resource::{LockMode, ResourceInfo, ResourceManager, ResourceType, ScopedLock};
pub use task::{Task, TaskHandle, TaskPriority, TaskResult, TaskStatus};

#[cfg(test)]
mod tests;
