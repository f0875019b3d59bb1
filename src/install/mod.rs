//! 侧载安装：来源解析、解包、应用包解析、扩展询问与流水线阶段

pub mod archive;
pub mod bundle;
pub mod prompt;
pub mod source;
pub mod stages;

pub use archive::unzip_app_bundle;
pub use bundle::AppBundle;
pub use prompt::{AutoPrompt, ConsolePrompt, ExtensionDecision, ExtensionPrompt};
pub use source::SideloadSource;
pub use stages::{SideloadContext, SideloadPipelineFactory};
