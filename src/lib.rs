pub mod config;
pub mod image_operations;

pub use config::Config;
pub use image_operations::{router, AppState};
