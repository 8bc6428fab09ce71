/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
*/

use std::fmt;

pub type WorkflowResult<T> = Result<T, Error>;

/// Errors surfaced at the public boundary of the workflow engine and the
/// resource manager. Task bodies never see these directly; a failing
/// `Task::execute` is caught by the engine and folded into a `TaskResult`.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// A resource id, task id, or argument was malformed or already taken
    InvalidArgument(String),
    /// The named resource or task does not exist
    NotFound(String),
    /// A duplicate id was submitted
    Conflict(String),
    /// A lock or wait operation exceeded its deadline
    Timeout(String),
    /// The task was cancelled before or during execution
    Cancelled(String),
    /// A reservation would have pushed `used` past `capacity`
    CapacityExceeded(String),
    /// Unexpected internal condition
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::CapacityExceeded(msg) => write!(f, "capacity exceeded: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}
