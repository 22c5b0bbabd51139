pub mod allocate;
pub mod alpaca;
pub mod broker;
pub mod config;
pub mod control;
pub mod error;
pub mod execution;
pub mod features;
pub mod forecast;
pub mod model;
pub mod store;
pub mod updater;
