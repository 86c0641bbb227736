pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod types;

pub use config::ParleyConfig;
pub use error::{ParleyError, Result};
pub use events::ChatEvent;
pub use types::*;
