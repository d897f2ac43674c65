//! Bluetooth communication layer.
//!
//! L2CAP socket plumbing, the lifecycle manager actor, and the companion
//! device link.

pub mod companion;
pub mod l2cap;
pub mod manager;
