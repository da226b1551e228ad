//! Ember 工具集
//!
//! 提供日志初始化、工作区路径管理等在各个 crate 之间共享的工具。
//!
//! # EmberPath
//! 基于工作区根目录的统一路径管理，避免硬编码相对路径。

pub mod ember_path;
pub mod init_log;
