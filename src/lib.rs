pub mod admission;
pub mod app;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod lock;
pub mod logging;
pub mod model;
pub mod mutation;
pub mod notify;
pub mod retry;
pub mod storage;
pub mod workers;
