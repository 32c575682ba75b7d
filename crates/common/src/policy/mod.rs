//! Compiled access policy
//!
//! - **[`PolicyTable`]**: the decision table of one data class
//! - **[`CompiledContract`]**: every table of one contract version
//! - **[`PolicyRegistry`]**: immutable contract generations, swapped atomically

mod registry;
mod table;

pub use registry::PolicyRegistry;
pub use table::{CompiledContract, Permission, PolicyTable, DEFAULT_DISTANCE};
