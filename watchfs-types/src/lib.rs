//! Types used by the [watchfs](https://docs.rs/watchfs) crate.
//!
//! This crate contains the portable event model shared by every monitor
//! backend: the [`EventFlags`](event::EventFlags) set, its canonical name
//! table, and the [`Event`](event::Event) record delivered to callbacks.

pub mod event;

pub use event::{Event, EventFlags};
