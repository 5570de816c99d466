pub mod config;
pub mod disk;
pub mod error;
pub mod relocate;
pub mod utils;
