pub mod config;
pub mod dashboard;
pub mod error;
pub mod node;
pub mod notifier;
pub mod peer;
pub mod pruner;
pub mod registry;
pub mod scope;
pub mod shutdown;
pub mod timer;

pub use error::{RelayError, Result};
