//! Raw-frame I/O: the pcap-backed capture engine, the token-bucket send
//! limiter, and the PCAP replay source.

pub mod capture;
pub mod ratelimit;
pub mod replay;
