//! Workspace root crate.
//!
//! Re-exports the loop physics, safety and controller crates so integration tests can depend on a single crate.

pub use controller::*;
pub use safety::*;
pub use sim::*;
