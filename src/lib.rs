pub mod api;
pub mod classifier;
pub mod config;
pub mod connection;
pub mod db;
pub mod feed;
pub mod history;
pub mod house_store;
pub mod mqtt;
pub mod sensors;
pub mod settings;
pub mod thresholds;
pub mod value;
