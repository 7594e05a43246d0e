pub mod aggregate;
pub mod runner;
pub mod system;
pub mod users;

pub use aggregate::{Collect, SnapshotAggregator};
pub use runner::CommandRunner;
