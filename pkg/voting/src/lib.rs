#[macro_use]
extern crate error_chain;

extern crate core;

pub mod config;
pub mod election;
pub mod errors;
pub mod failure_detector;
pub mod groups;
pub mod membership;
pub mod multicast;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;
