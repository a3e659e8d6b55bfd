pub mod arn;
pub mod config;
pub mod image;

pub use arn::{Arn, ArnError, ResourceKind};
pub use config::{BerthConfig, ConfigError, validate_name};
pub use image::{ImageError, ImageRef};
