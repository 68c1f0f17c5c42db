//! Client half of an incremental change synchronization protocol.
//!
//! - [`clock`]: change keys, causal histories and the conflict rule.
//! - [`tree`]: dirty-tracking object trees and their save payloads.
//! - [`conflict`]: conflict detection and conflict copies.
//! - [`session`]: the RPC seam and the save/load round trip.
//! - [`transfer`]: bounded streaming of large bodies.
//! - [`import`]: the coordinator applying batches of remote changes.
//! - [`cursor`]: resumable sync cursors and where they are kept.
pub mod clock;
pub mod config;
pub mod conflict;
pub mod cursor;
pub mod error;
pub mod ids;
pub mod import;
pub mod logs;
pub mod session;
pub mod tags;
pub mod transfer;
pub mod tree;

pub use error::{Result, RpcError, SyncError};
