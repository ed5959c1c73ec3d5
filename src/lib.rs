pub mod config;
pub mod egress;
pub mod stats;
pub mod whitelist;

pub mod api;
pub mod proxy;
