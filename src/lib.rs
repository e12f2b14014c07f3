//! Core of a network device simulator: one host process impersonates many
//! devices on a single layer-2 interface, answering discovery, control,
//! management and application protocols for each of them.
//!
//! The packet plane reads raw frames through [`netio`], decodes them in
//! [`core::frame`], and fans them out to per-protocol handlers registered
//! with the [`dispatch`] dispatcher. Protocol state lives in the per-device
//! engines ([`snmp`], [`dhcp`], [`proto`]); [`lifecycle`] owns startup,
//! shutdown and the in-process control surface.

pub mod config;
pub mod core;
pub mod dhcp;
pub mod dispatch;
pub mod errorinj;
pub mod lifecycle;
pub mod netio;
pub mod proto;
pub mod snmp;
pub mod traffic;
pub mod utils;
