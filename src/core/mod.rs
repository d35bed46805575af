pub mod db;
pub mod error;
pub mod key;
pub mod manifest;
pub mod schemas;
pub mod store;
pub mod time;
