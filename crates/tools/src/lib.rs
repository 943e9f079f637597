//! `tools` crate — the `ToolExecutor` capability the workflow engine calls into.
//!
//! Every CDN operation (zone creation, certificate enrollment, property
//! activation, purge, …) is reached through [`ToolExecutor::execute`].  The
//! engine never knows the operation catalog; it only passes a tool name and
//! a JSON argument object.

pub mod error;
pub mod traits;
pub mod registry;
pub mod dry_run;
pub mod mock;

pub use error::ToolExecutionError;
pub use traits::{Tool, ToolExecutor};
pub use registry::ToolRegistry;
pub use dry_run::DryRunExecutor;
