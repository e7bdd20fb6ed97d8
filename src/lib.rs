//! The keyward daemon: a network custodian of disk-encryption keys.
//!
//! Hosts encrypt local block devices with random keys and escrow them
//! here. The daemon enforces access policy (password, optional mutual
//! TLS, per-key concurrent-holder caps), tracks holder liveness, queues
//! admin commands for specific holders, and can keep long-term key
//! material on an upstream KMIP appliance.

pub mod admin;
pub mod config;
pub mod mailer;
pub mod memlock;
pub mod service;
pub mod sysconfig;
pub mod transport;
