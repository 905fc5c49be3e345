//! The per-target SSH tail worker and its connection lifecycle.

mod ssh;
mod worker;

pub use worker::SshLogScraper;
