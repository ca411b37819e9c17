//! Leader election across every node sharing one database.
//!
//! - [`lock`]: advisory lock key and statements
//! - [`elector`]: the [`LeaderElector`] actor and its [`PeerHandle`]

pub mod elector;
pub mod lock;

pub use elector::{LeaderElector, PeerHandle, PeerMessage};
