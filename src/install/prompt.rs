//! 扩展处理询问
//!
//! 包含扩展的应用在安装前暂停，等待「保留 / 删除 / 取消」决定。

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::install::AppBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionDecision {
    Keep,
    Remove,
    Cancel,
}

#[async_trait]
pub trait ExtensionPrompt: Send + Sync {
    async fn decide(&self, bundle: &AppBundle) -> ExtensionDecision;
}

/// 固定回答
#[derive(Debug, Clone, Copy)]
pub struct AutoPrompt(pub ExtensionDecision);

impl AutoPrompt {
    pub fn keep() -> Self {
        Self(ExtensionDecision::Keep)
    }

    pub fn remove() -> Self {
        Self(ExtensionDecision::Remove)
    }

    pub fn cancel() -> Self {
        Self(ExtensionDecision::Cancel)
    }
}

impl Default for AutoPrompt {
    fn default() -> Self {
        Self::keep()
    }
}

#[async_trait]
impl ExtensionPrompt for AutoPrompt {
    async fn decide(&self, _bundle: &AppBundle) -> ExtensionDecision {
        self.0
    }
}

/// 终端交互：从标准输入读取 k / r / c
#[derive(Debug, Default)]
pub struct ConsolePrompt;

#[async_trait]
impl ExtensionPrompt for ConsolePrompt {
    async fn decide(&self, bundle: &AppBundle) -> ExtensionDecision {
        let question = format!(
            "{} contains {} app extension(s). [k]eep / [r]emove / [c]ancel? ",
            bundle.name,
            bundle.extension_count()
        );
        let answer = tokio::task::spawn_blocking(move || {
            print!("{question}");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => match line.trim().to_ascii_lowercase().as_str() {
                "k" | "keep" | "" => ExtensionDecision::Keep,
                "r" | "remove" => ExtensionDecision::Remove,
                _ => ExtensionDecision::Cancel,
            },
            _ => ExtensionDecision::Cancel,
        }
    }
}

/// 询问并等待；取消或超时均视为 Cancel
pub async fn ask(
    prompt: &dyn ExtensionPrompt,
    bundle: &AppBundle,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> ExtensionDecision {
    let decision = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, prompt.decide(bundle)).await {
                Ok(decision) => decision,
                Err(_) => {
                    tracing::info!(bundle = %bundle.bundle_identifier, "Extension prompt timed out");
                    ExtensionDecision::Cancel
                }
            },
            None => prompt.decide(bundle).await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => ExtensionDecision::Cancel,
        decision = decision => decision,
    }
}
