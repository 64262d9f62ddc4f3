pub mod access;
pub mod balance;
pub mod completion;
pub mod config;
pub mod error;
pub mod reducer;
pub mod server;
pub mod session;
pub mod stream;
pub mod tier;
pub mod usage;
