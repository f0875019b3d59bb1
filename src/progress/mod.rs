//! 进度树
//!
//! 以「单位数」加权的可组合进度：节点自身完成单位 + 子节点完成比例 × 权重，除以总单位。
//! 取消沿子树向下传播；节点可绑定 CancellationToken，取消进度即取消其所属操作。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Node {
    total_units: u64,
    completed_units: u64,
    children: Vec<(Progress, u64)>,
    cancelled: bool,
    token: Option<CancellationToken>,
}

/// 进度节点（克隆共享同一节点）
#[derive(Debug, Clone)]
pub struct Progress {
    inner: Arc<Mutex<Node>>,
}

impl Progress {
    pub fn new(total_units: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Node {
                total_units,
                ..Node::default()
            })),
        }
    }

    /// 绑定取消令牌：cancel() 时一并取消
    pub fn with_cancellation(self, token: CancellationToken) -> Self {
        {
            let mut node = self.lock();
            if node.cancelled {
                token.cancel();
            }
            node.token = Some(token);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, Node> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total_units(&self) -> u64 {
        self.lock().total_units
    }

    /// 挂载子节点；子节点完成比例贡献父节点 weight / total_units
    pub fn add_child(&self, child: &Progress, weight: u64) {
        if Arc::ptr_eq(&self.inner, &child.inner) {
            return;
        }
        let cancelled = {
            let mut node = self.lock();
            node.children.push((child.clone(), weight));
            node.cancelled
        };
        if cancelled {
            child.cancel();
        }
    }

    /// 增加完成单位，截断到 total_units
    pub fn advance(&self, units: u64) {
        let mut node = self.lock();
        node.completed_units = node.completed_units.saturating_add(units).min(node.total_units);
    }

    /// 设置完成单位；只增不减
    pub fn set_completed(&self, units: u64) {
        let mut node = self.lock();
        let units = units.min(node.total_units);
        if units > node.completed_units {
            node.completed_units = units;
        }
    }

    pub fn complete(&self) {
        let mut node = self.lock();
        node.completed_units = node.total_units;
    }

    pub fn completed_units(&self) -> u64 {
        self.lock().completed_units
    }

    /// 完成比例，始终位于 [0, 1]
    pub fn fraction_completed(&self) -> f64 {
        let (total, completed, children) = {
            let node = self.lock();
            (node.total_units, node.completed_units, node.children.clone())
        };
        if total == 0 {
            return 0.0;
        }
        let from_children: f64 = children
            .iter()
            .map(|(child, weight)| child.fraction_completed() * *weight as f64)
            .sum();
        ((completed as f64 + from_children) / total as f64).clamp(0.0, 1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.fraction_completed() >= 1.0
    }

    /// 取消本节点及所有后代；幂等
    pub fn cancel(&self) {
        let (children, token) = {
            let mut node = self.lock();
            if node.cancelled {
                return;
            }
            node.cancelled = true;
            (node.children.clone(), node.token.clone())
        };
        if let Some(token) = token {
            token.cancel();
        }
        for (child, _) in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }
}
