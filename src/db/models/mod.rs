#![allow(unused_imports)]

//! Database models split into separate files.
//! This module re-exports individual model modules so existing imports like
//! `use crate::db::models::*;` continue to work.

pub mod dead_letter;
pub mod resource_snapshot;
pub mod task;
pub mod task_event;
pub mod webhook;

// Re-export all types at the `crate::db::models` namespace.
pub use self::dead_letter::*;
pub use self::resource_snapshot::*;
pub use self::task::*;
pub use self::task_event::*;
pub use self::webhook::*;
