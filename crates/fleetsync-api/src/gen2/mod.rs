// Gen2 JSON-RPC API (HTTP Digest auth).

pub mod client;
pub mod rpc;

pub use client::Gen2Client;
