pub mod api;
pub mod codec;
pub mod remote;
pub mod session;
pub mod snapshot;
pub mod tail;
pub mod transcript;
pub mod ws;

#[cfg(feature = "client")]
pub mod client;
