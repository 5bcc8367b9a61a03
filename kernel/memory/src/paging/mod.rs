//! Multi-level paging: entries, tables, and the walker that edits them.
//!
//! The hierarchy is 4 levels deep on x86_64 (512-entry tables) and 2
//! levels on x86 (1024-entry tables); the walker is written against the
//! geometry constants in `kernel_config` and does not otherwise care.
//! Table memory is always reached through the linear mapping, so any
//! address space can be edited from any CPU without being active.

mod entry;
mod mapper;
mod table;

pub use entry::{EntryFlags, PageTableEntry};
pub use mapper::Mapper;
pub use table::Table;
