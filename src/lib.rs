pub mod commands;
pub mod config;
pub mod credential;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod state;
pub mod target;
pub mod tls;
pub mod upstream;
pub mod web;
