pub mod catalog;
pub mod config;
pub mod db;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod importer;
pub mod jats;
pub mod output;
pub mod state;
pub mod store;
