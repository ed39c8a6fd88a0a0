//! # RT目录模块
//!
//! 疗程、DICOM文件、同义词和增强结构集的目录。提供SQLite实现和内存实现。

pub mod catalog;
pub mod memory;
pub mod models;
pub mod sqlite;

// 重新导出主要类型
pub use catalog::FileCatalog;
pub use memory::MemoryCatalog;
pub use sqlite::SqliteCatalog;
