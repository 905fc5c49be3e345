//! The `/metrics` scrape endpoint.

mod server;

pub use server::Server;
