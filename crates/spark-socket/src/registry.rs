//! # ConnectionRegistry：存活连接登记表
//!
//! ## 核心意图（Why）
//! - 为 [`SocketContext::stop_all`](crate::SocketContext::stop_all) 提供“一键停止”的依据：
//!   所有客户端、服务端与 UDP 端点在构造时登记，在 `stop()` 时注销；
//! - 基于 `DashMap` 的分片锁保证任意线程并发登记/注销时无需全局互斥。
//!
//! ## 行为契约（What）
//! - `register`：以 [`ConnectionId`] 为键写入；
//! - `deregister`：幂等移除，返回是否确有条目被移除；
//! - `stop_all`：先快照全部条目并释放分片锁，再逐个调用 `stop()`。被停止的连接
//!   会在 `stop()` 中回调 `deregister`，若在持锁迭代期间执行将与分片写锁自锁。
//!
//! ## 风险提示（Trade-offs）
//! - 登记表持有连接内部状态的强引用，未调用 `stop()` 的连接不会被释放；
//!   宿主应在退出前调用 `stop_all`。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;

/// 连接的进程内唯一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 可被登记表统一停止的连接。
///
/// - **契约 (What)**：`stop` 必须幂等，并在首次调用时执行
///   [`ConnectionRegistry::deregister`]；
/// - **风险 (Trade-offs)**：`stop` 可能在任意线程上被调用，实现方不得假设调用线程。
pub trait ManagedConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// 人类可读的连接描述，用于诊断日志。
    fn describe(&self) -> String;

    fn stop(&self);
}

/// 存活连接的并发登记表。
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Arc<dyn ManagedConnection>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.connections.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配新的连接标识，从 1 开始单调递增。
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, connection: Arc<dyn ManagedConnection>) {
        self.connections.insert(connection.id(), connection);
    }

    /// 移除条目；重复调用返回 `false`。
    pub fn deregister(&self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// 停止全部已登记连接，返回本次快照中的连接数。
    ///
    /// # 教案式注释
    /// - **逻辑 (How)**：`iter()` 持有分片读锁，因此先将 `Arc` 克隆进 `Vec`，迭代器
    ///   析构后再调用 `stop()`；
    /// - **契约 (What)**：快照之后新登记的连接不受影响；停止顺序不作保证。
    pub fn stop_all(&self) -> usize {
        let snapshot: Vec<Arc<dyn ManagedConnection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in &snapshot {
            connection.stop();
        }
        snapshot.len()
    }
}
