//! # txtrack Protocol
//!
//! Data types exchanged between the txtrack engine, the upstream content
//! repository and the search index.
//!
//! This crate provides:
//! - `Transaction` and `TransactionPage` for repository change units
//! - `NodeMutation` and `NodeStatus` for per-node changes
//! - `Cursor` for durable synchronization progress, with its CBOR record
//! - Query types for listing transactions and nodes
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod error;
mod node;
mod transaction;

pub use cursor::{Cursor, CURSOR_RECORD_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use node::{NodeContent, NodeMutation, NodeQuery, NodeStatus, StoreRef};
pub use transaction::{Transaction, TransactionPage, TransactionQuery};
