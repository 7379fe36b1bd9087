//! Library crate for mc-server-indexer: discovers Minecraft servers with masscan,
//! pings them over the status protocol and keeps a JSON index of what answered.
pub mod config;
pub mod crawl;
pub mod dns;
pub mod error;
pub mod exclude;
pub mod masscan;
pub mod partition;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod types;
