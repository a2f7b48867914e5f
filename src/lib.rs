pub mod bus;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod notifications;
