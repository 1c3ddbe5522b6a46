//! Types shared by the streamvault binaries: configuration and the remote
//! storage wire protocol.

pub mod config;
pub mod protocol;
