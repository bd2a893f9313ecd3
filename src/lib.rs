//! # worldstore - Object Persistence for a Multiplayer World Server
//!
//! Persists a world's objects (items in named storage areas, characters, what they
//! carry and what they wear) in a single SQLite file, and loads them back lazily,
//! one root and its contents at a time.
//!
//! ## Features
//!
//! - **Schema Binding**: main-table columns are read from the database and every
//!   statement is built once per table and reused
//! - **Lazy Loading**: roots load by name, anything else through its toplevel owner;
//!   nested contents resolve breadth-first with deferred attachment
//! - **Commit & Reconciliation**: per-category transactions, followed by a pass that
//!   finds records which moved to another category or belong to destroyed objects
//! - **Filtered Search**: a small predicate language compiled to parametrized SQL
//! - **Bulk Import**: index-free, relaxed-durability loading with container checks
//! - **Backups**: online snapshots archived as tar.gz with SHA256 verification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use worldstore::config::Config;
//! use worldstore::store::{World, WorldStore};
//! use worldstore::store::objects::TypeCatalog;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let mut store = WorldStore::from_config(&config.store)?;
//!     let mut world = World::new(TypeCatalog::new());
//!     store.boot(&mut world)?;
//!     let matches = store.search_area(&mut world, "bank", "Amount > 100")?;
//!     println!("{} piles of more than 100", matches.len());
//!     store.commit(&mut world)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`store`] - the store itself: session, binder, loader, commit engine, import, backups
//! - [`config`] - TOML configuration
//! - [`validation`] - area and property name checks
//! - [`logutil`] - log-safe rendering of untrusted strings

pub mod config;
pub mod logutil;
pub mod store;
pub mod validation;
