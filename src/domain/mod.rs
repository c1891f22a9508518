pub mod error;
pub mod gears;
pub mod models;
pub mod settings;
