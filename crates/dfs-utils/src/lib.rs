pub mod background_runner;
pub mod file_utils;

pub use background_runner::BackgroundRunner;
