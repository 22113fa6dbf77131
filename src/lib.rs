pub mod batcher;
pub mod cache;
pub mod config;
pub mod error;
pub mod generation;
pub mod health;
pub mod orchestrator;
pub mod poller;
pub mod response;
pub mod server;
pub mod service;
pub mod supervisor;
pub mod tools;
pub mod tracker;
pub mod transport;
