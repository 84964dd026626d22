pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::ItsConfig;
pub use error::{ItsError, Result};
pub use server::{CommandHandler, ItsServer};
