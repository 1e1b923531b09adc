//! # missive-store
//!
//! Local persistence for the Missive delivery engine, backed by SQLite.
//!
//! The optimistic ledger and the offline queue are written through to two
//! tables so that a force-quit during an offline compose loses nothing. The
//! crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection` with typed helpers for both collections.

pub mod database;
pub mod ledger;
pub mod migrations;
pub mod queue;

mod error;
mod rows;

pub use database::Database;
pub use error::{Result, StoreError};
