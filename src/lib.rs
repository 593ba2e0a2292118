pub mod adapter;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod error;
pub mod evidence;
pub mod gene;
pub mod http;
pub mod manager;
pub mod merge;
pub mod output;
pub mod processor;
pub mod progress;
pub mod providers;
pub mod scoring;
pub mod store;
