pub mod config;
pub mod error;
pub mod expect;
pub mod fuzzer;
pub mod generator;
pub mod options;
pub mod postgres;
pub mod report;
pub mod session;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use fuzzer::{Fuzzer, FuzzerError};
