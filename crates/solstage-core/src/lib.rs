// Library root: the filter document, pointer conventions, and local
// infrastructure (config, SQLite cache) shared by the client and app crates.

pub mod account;
pub mod config;
pub mod db;
pub mod filter;
pub mod hash;
pub mod keys;
pub mod memo;
