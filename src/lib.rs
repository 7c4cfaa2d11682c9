pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod known_hosts;
pub mod logging;
pub mod parse;
pub mod path;
pub mod profile;
pub mod prompt;
pub mod queue;
pub mod remote;
pub mod transfer;
pub mod util;

pub use error::TransferError;
