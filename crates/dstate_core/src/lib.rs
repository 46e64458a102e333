//! # Disconnected State Core
//!
//! Offline working set for an object store: entities are fetched once,
//! mutated without a connection, and later replayed against the store
//! in a single version-checked transaction.
//!
//! This crate provides:
//! - [`DisconnectedState`], the facade holding the cache and the log
//! - [`EntityCache`] with per-entity [`PersistenceState`]
//! - [`VersionTracker`] for version bumps along version roots
//! - [`RemovalPlanner`] enforcing removal policies before any mutation
//! - [`PinSet`] holding entities back from partial flushes
//! - [`SyncEngine`] replaying operation logs with key remapping
//! - [`BackingSession`], the seam to the store, and [`MemoryStore`]
//!
//! ## Lifecycle
//!
//! 1. Attach a session and prefetch through [`Attached::connect`]
//! 2. Detach and mutate offline; every change is logged
//! 3. Attach again and call [`Attached::save_changes`]
//!
//! ## Key Invariants
//!
//! - A rejected mutation changes nothing
//! - A failed replay leaves both the store and the log untouched
//! - Version stamps only move forward
//! - A committed save rewrites every temporary key it created

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod disconnected;
mod entity;
mod error;
mod integrity;
mod pin;
mod schema;
mod session;
mod sync;
mod version;

pub use config::{Config, MergeMode, PinCascade};
pub use disconnected::{Attached, Connected, DisconnectedState, TransactionScope};
pub use entity::{EntityCache, EntityState, PersistenceState};
pub use error::{CoreError, CoreResult};
pub use integrity::{RemovalPlan, RemovalPlanner};
pub use pin::{PinGuard, PinSet};
pub use schema::{FieldDef, FieldKind, RemovalPolicy, Schema, TypeDef, TypeDefBuilder};
pub use session::{BackingSession, MemorySession, MemoryStore, Query};
pub use sync::{SyncEngine, SyncState, SyncStats};
pub use version::{Conflict, VersionTracker};
