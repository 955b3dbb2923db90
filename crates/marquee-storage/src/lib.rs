//! Marquee Storage crate - durable SQLite persistence for vector index entries.
//!
//! Provides a WAL-mode SQLite database with migrations and a repository
//! for the text and visual collections.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{decode_vector, encode_vector, EntryRepository, StoredEntry};
