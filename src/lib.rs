//! sideloader - 第三方应用侧载、激活槽位管理与维护
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、通知策略、状态投影、进行中操作登记、工作池、关闭处理、编排器
//! - **device**: 设备传输接口与模拟设备
//! - **install**: 侧载来源、解包、应用包解析、扩展询问与流水线阶段
//! - **observability**: tracing 初始化
//! - **pipeline**: 阶段 DAG、构建器与执行引擎
//! - **progress**: 加权进度树
//! - **slots**: 槽位账本与激活槽位管理器
//! - **store**: 应用记录存储

pub mod config;
pub mod core;
pub mod device;
pub mod install;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod slots;
pub mod store;

pub use crate::core::{ErrorKind, Orchestrator};
