pub mod classify;
pub mod facade;
pub mod presenter;
pub mod record;
pub mod storage;
pub mod store;
