// 网盘API模块

pub mod api;
pub mod client;
pub mod error;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use api::PcsApi;
pub use client::PcsClient;
pub use error::{ErrorClassifier, PcsError, PcsErrorKind, RetryDecision};
pub use types::*;
