//! Device model, frame model and the shared error taxonomy.

pub mod device;
pub mod errors;
pub mod frame;
pub mod table;
