pub mod config;
pub mod db;
pub mod http;
pub mod keys;
pub mod logging;
pub mod nostr;
pub mod server;
