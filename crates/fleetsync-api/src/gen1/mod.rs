// Gen1 REST API (HTTP Basic auth).

pub mod client;

pub use client::Gen1Client;
