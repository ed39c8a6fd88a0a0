//! # RT Core
//!
//! 放疗疗程解析系统的核心模块，提供错误定义、基础数据结构、全局配置和通用工具。

pub mod config;
pub mod error;
pub mod models;
pub mod utils;

pub use config::{ConfigValidator, DoseConfig, LateralityConfig, LoggingConfig, RtConfig};
pub use error::{Result, RtError};
pub use models::*;
