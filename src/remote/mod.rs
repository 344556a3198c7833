//! Remote source module
//!
//! Interface to the remote document store plus an in-process implementation
//! used by the demo binary and the test suites.

pub mod memory;
pub mod traits;

pub use memory::MemoryRemote;
pub use traits::{RemoteQuery, RemoteSource, SnapshotStream};
