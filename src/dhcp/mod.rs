//! DHCP servers: v4 and v6 state machines over a shared lease-table model.

pub mod lease;
pub mod options;
pub mod v4;
pub mod v6;
