pub mod accounts;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod skylink;
pub mod worker;

pub use config::Config;
pub use db::{LockClient, LockError};
pub use error::{ConfigError, Result, ScannerError};
pub use skylink::{Skylink, SkylinkError};
