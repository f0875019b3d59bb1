//! 流水线：阶段 DAG、构建器与执行引擎

pub mod types;
pub mod graph;
pub mod builder;
pub mod engine;

pub use types::*;
pub use graph::PipelineGraph;
pub use builder::PipelineBuilder;
pub use engine::{Pipeline, PipelineHandle};
