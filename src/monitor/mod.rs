pub mod change;
pub mod local;
pub mod provider;
pub mod service;
