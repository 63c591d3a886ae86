//! Tools for serving files and block devices over the Network Block Device
//! (NBD) protocol.
//!
//! The [`Server`] speaks the fixed-newstyle dialect of the protocol and can
//! expose any number of named [`Export`]s, looked up in a [`Registry`] during
//! option negotiation; the optional structured-reply extension is supported
//! for transmission replies. [`client::Client`] is a matching client for the
//! subset of the protocol the server speaks.

pub mod client;
mod export;
mod proto;
mod server;

pub use export::{Blocks, Export, MemBlocks, Registry, DEFAULT_EXPORT};
pub use server::Server;
