pub mod account;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pairing;
pub mod playback;
pub mod replay;
pub mod scrobble;
pub mod service;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;
