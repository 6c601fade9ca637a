pub mod asyncutil;
pub mod build_info;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod installer;
pub mod launcher;
pub mod lifecycle;
pub mod listener;
pub mod log;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod terminal;
pub mod watchdog;
