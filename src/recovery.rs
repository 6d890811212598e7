//! Crash recovery.
//!
//! Brings the data files up to date with every operation the WAL holds a
//! complete record of. Runs when a storage is opened, before anything else
//! touches its files.

pub mod replay;

pub use replay::{RecoveryStats, WalReplay};
