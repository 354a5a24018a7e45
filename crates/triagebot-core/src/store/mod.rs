pub mod suppression;
pub mod tasks;

pub use suppression::{Blacklist, SuppressionStore};
pub use tasks::TaskStore;
