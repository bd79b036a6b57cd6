pub mod admin;
pub mod app;
pub mod availability;
pub mod calendar;
pub mod config;
pub mod forms;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod outcome;
pub mod reaper;
pub mod repository;
pub mod session;
pub mod store;
pub mod wal;
pub mod workflow;
