//! # concord-ot — Operational transform for plain text
//!
//! The pure algorithmic core of Concord's collaborative editing: an
//! immutable operation model and the transform function that rebases
//! concurrent edits so every replica converges on the same text.
//!
//! ```text
//! ┌──────────┐  submit(op, base version)   ┌────────────────┐
//! │ Client A │ ───────────────────────────► │   Authority    │
//! └──────────┘                              │ (concord-engine)│
//! ┌──────────┐                              │                │
//! │ Client B │ ───────────────────────────► │  transform(.,.)│ ◄── this crate
//! └──────────┘                              └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — retain/insert/delete components, `apply`
//! - [`transform`] — concurrent rebase + cursor adjustment
//!
//! No I/O, no allocation beyond the produced operations, safe to call
//! from any thread.

pub mod operation;
pub mod transform;

pub use operation::{OpComponent, Operation, OtError};
pub use transform::{transform, transform_cursor};
