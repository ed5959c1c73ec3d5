//! Destination whitelist: parsed entries, the live snapshot and its
//! background refresh.

pub mod entry;
pub mod resolver;

pub use entry::WhitelistEntry;
pub use resolver::{WhitelistResolver, WhitelistSnapshot};
