pub mod cache;
pub mod config;
pub mod errors;
pub mod models;
pub mod providers;
pub mod runner;
pub mod scheduler;
pub mod xmltv;

pub use config::Config;
pub use errors::{AppError, AppResult};
pub use runner::{RunOutcome, RunReport, run, update_channels};
