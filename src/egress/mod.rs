//! Authorized outbound dialing with rotating source addresses.

pub mod dialer;

pub use dialer::{DialError, EgressConn, EgressDialer, NetworkKind};
