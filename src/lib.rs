#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod core;
mod error;
mod executor;
mod flow;
mod task;
#[cfg(feature = "logging")]
mod utils;

pub use crate::context::Context;
pub use crate::core::{Inputs, Leaves, TaskOutput, TaskResult, Value};
pub use crate::error::*;
pub use crate::executor::{Diagnostics, TaskExecution};
pub use crate::flow::{Flow, FlowStream, Report};
pub use crate::task::Task;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
