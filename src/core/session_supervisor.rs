//! 会话监管：停止与配置下发
//!
//! SessionSupervisor 留在 SessionManager 一侧；EngineControl 交给引擎，在步骤边界检查停止信号并应用配置补丁。
//! 两者都不会打断正在进行的推理或工具调用。

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfigPatch;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    config_tx: mpsc::UnboundedSender<AgentConfigPatch>,
}

/// 引擎侧句柄
#[derive(Debug)]
pub struct EngineControl {
    cancel_token: CancellationToken,
    config_rx: mpsc::UnboundedReceiver<AgentConfigPatch>,
}

impl SessionSupervisor {
    pub fn new() -> (Self, EngineControl) {
        let cancel_token = CancellationToken::new();
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        (
            Self {
                cancel_token: cancel_token.clone(),
                config_tx,
            },
            EngineControl {
                cancel_token,
                config_rx,
            },
        )
    }

    /// 请求停止（协作式，下一步骤边界生效）
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 引擎已退出时返回 false
    pub fn update_config(&self, patch: AgentConfigPatch) -> bool {
        self.config_tx.send(patch).is_ok()
    }
}

impl EngineControl {
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn take_patches(&mut self) -> Vec<AgentConfigPatch> {
        let mut patches = Vec::new();
        while let Ok(p) = self.config_rx.try_recv() {
            patches.push(p);
        }
        patches
    }
}
