pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod scheduler;

pub use config::Config;
pub use error::{Error, Result};
pub use scheduler::{Scheduler, TaskHandle};
