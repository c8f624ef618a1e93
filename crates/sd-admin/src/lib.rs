//! sd-admin library: Exposes the admin tool's components for testing.
//!
//! This is a thin library layer over the binary, allowing integration tests
//! to drive the same wiring against temporary directories.

pub mod app;
pub mod config;
pub mod native_fs;

pub use app::{App, AppError};
pub use config::{Config, ConfigError};
pub use native_fs::NativeFs;
