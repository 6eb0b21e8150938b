//! Transparent Redis master/replica proxy: RESP on the client side, writes
//! to a single master, reads to healthy replicas, with session stickiness
//! for transactions, pub/sub, and blocking commands.

pub mod classify;
pub mod command;
pub mod config;
pub mod error;
pub mod pool;
pub mod resp;
pub mod session;
pub mod stats;
