//! # diagnostics：连接级诊断事件
//!
//! ## 意图（Why）
//! - 运行期失败（建连、发送、读取）按约定不抛给调用方，而是作为结构化事件交给
//!   宿主注入的 [`DiagnosticHook`]；
//! - 钩子随 [`SocketContext`](crate::SocketContext) 一起注入，不存在进程级全局状态。
//!
//! ## 契约（What）
//! - 事件以借用形式传递，钩子若需保留信息应自行拷贝（例如 [`DiagnosticEvent::kind`]）；
//! - 钩子可能在任意后台线程上被调用，且调用时连接内部不持有任何锁。
//!
//! ## 默认实现（How）
//! - [`TracingDiagnostics`] 将事件映射为 `tracing` 事件：生命周期事件为 `info`，
//!   可重试的建连失败为 `debug`，收发失败为 `warn`。

use std::{net::SocketAddr, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::{ErrorCategory, SocketError},
    registry::ConnectionId,
};

/// 连接生命周期中的诊断事件。
#[derive(Debug)]
pub enum DiagnosticEvent<'a> {
    /// 客户端启动了一个新的建连线程。
    ConnectStarted {
        connection: ConnectionId,
        target: &'a str,
    },
    /// 建连成功。
    Connected {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    /// 单次建连尝试失败，`retry_in` 后重试。
    ConnectFailed {
        connection: ConnectionId,
        attempt: u32,
        retry_in: Duration,
        error: &'a SocketError,
    },
    /// 读循环失败后重新发起建连。
    Reconnecting { connection: ConnectionId },
    /// 同步写失败。
    SendFailed {
        connection: ConnectionId,
        peer: Option<SocketAddr>,
        error: &'a SocketError,
    },
    /// 读循环失败（含对端有序关闭）。
    ReadFailed {
        connection: ConnectionId,
        peer: SocketAddr,
        error: &'a SocketError,
    },
    /// 服务端接受了新的对端。
    PeerAccepted {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    /// 对端节点被从链上摘除。
    PeerRemoved {
        connection: ConnectionId,
        peer: SocketAddr,
        remaining: usize,
    },
    /// 监听器接受连接失败。
    AcceptFailed {
        connection: ConnectionId,
        error: &'a SocketError,
    },
    /// 轮询请求未能发出，轮询立即返回。
    PollSendFailed { connection: ConnectionId },
    /// 连接已停止。
    Stopped {
        connection: ConnectionId,
        description: &'a str,
    },
    /// 开始停止登记表中的全部连接。
    StoppingAll { count: usize },
}

/// [`DiagnosticEvent`] 的无负载判别值，便于测试与计数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    ConnectStarted,
    Connected,
    ConnectFailed,
    Reconnecting,
    SendFailed,
    ReadFailed,
    PeerAccepted,
    PeerRemoved,
    AcceptFailed,
    PollSendFailed,
    Stopped,
    StoppingAll,
}

impl DiagnosticEvent<'_> {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            DiagnosticEvent::ConnectStarted { .. } => DiagnosticKind::ConnectStarted,
            DiagnosticEvent::Connected { .. } => DiagnosticKind::Connected,
            DiagnosticEvent::ConnectFailed { .. } => DiagnosticKind::ConnectFailed,
            DiagnosticEvent::Reconnecting { .. } => DiagnosticKind::Reconnecting,
            DiagnosticEvent::SendFailed { .. } => DiagnosticKind::SendFailed,
            DiagnosticEvent::ReadFailed { .. } => DiagnosticKind::ReadFailed,
            DiagnosticEvent::PeerAccepted { .. } => DiagnosticKind::PeerAccepted,
            DiagnosticEvent::PeerRemoved { .. } => DiagnosticKind::PeerRemoved,
            DiagnosticEvent::AcceptFailed { .. } => DiagnosticKind::AcceptFailed,
            DiagnosticEvent::PollSendFailed { .. } => DiagnosticKind::PollSendFailed,
            DiagnosticEvent::Stopped { .. } => DiagnosticKind::Stopped,
            DiagnosticEvent::StoppingAll { .. } => DiagnosticKind::StoppingAll,
        }
    }

    /// 事件所属连接；`StoppingAll` 不属于任何单一连接。
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            DiagnosticEvent::ConnectStarted { connection, .. }
            | DiagnosticEvent::Connected { connection, .. }
            | DiagnosticEvent::ConnectFailed { connection, .. }
            | DiagnosticEvent::Reconnecting { connection }
            | DiagnosticEvent::SendFailed { connection, .. }
            | DiagnosticEvent::ReadFailed { connection, .. }
            | DiagnosticEvent::PeerAccepted { connection, .. }
            | DiagnosticEvent::PeerRemoved { connection, .. }
            | DiagnosticEvent::AcceptFailed { connection, .. }
            | DiagnosticEvent::PollSendFailed { connection }
            | DiagnosticEvent::Stopped { connection, .. } => Some(*connection),
            DiagnosticEvent::StoppingAll { .. } => None,
        }
    }
}

/// 诊断事件接收端。
pub trait DiagnosticHook: Send + Sync {
    fn record(&self, event: &DiagnosticEvent<'_>);
}

impl<F> DiagnosticHook for F
where
    F: Fn(&DiagnosticEvent<'_>) + Send + Sync,
{
    fn record(&self, event: &DiagnosticEvent<'_>) {
        self(event)
    }
}

/// 以 `tracing` 事件输出诊断信息的默认钩子。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDiagnostics;

impl DiagnosticHook for TracingDiagnostics {
    fn record(&self, event: &DiagnosticEvent<'_>) {
        match event {
            DiagnosticEvent::ConnectStarted { connection, target } => {
                debug!(connection = %connection, destination = %target, "connect started");
            }
            DiagnosticEvent::Connected { connection, peer } => {
                info!(connection = %connection, peer = %peer, "connected");
            }
            DiagnosticEvent::ConnectFailed {
                connection,
                attempt,
                retry_in,
                error,
            } => {
                if error.category() == ErrorCategory::NonRetryable {
                    warn!(
                        connection = %connection,
                        attempt,
                        retry_in_ms = retry_in.as_millis() as u64,
                        code = error.code(),
                        error = %error,
                        "connect attempt failed"
                    );
                } else {
                    debug!(
                        connection = %connection,
                        attempt,
                        retry_in_ms = retry_in.as_millis() as u64,
                        code = error.code(),
                        error = %error,
                        "connect attempt failed"
                    );
                }
            }
            DiagnosticEvent::Reconnecting { connection } => {
                info!(connection = %connection, "try to reconnect");
            }
            DiagnosticEvent::SendFailed {
                connection,
                peer,
                error,
            } => match peer {
                Some(peer) => warn!(
                    connection = %connection,
                    peer = %peer,
                    code = error.code(),
                    error = %error,
                    "send failed"
                ),
                None => warn!(
                    connection = %connection,
                    code = error.code(),
                    error = %error,
                    "send failed"
                ),
            },
            DiagnosticEvent::ReadFailed {
                connection,
                peer,
                error,
            } => {
                if error.category() == ErrorCategory::PeerClosed {
                    info!(connection = %connection, peer = %peer, error = %error, "peer disconnected");
                } else {
                    warn!(
                        connection = %connection,
                        peer = %peer,
                        code = error.code(),
                        error = %error,
                        "read failed"
                    );
                }
            }
            DiagnosticEvent::PeerAccepted { connection, peer } => {
                info!(connection = %connection, peer = %peer, "peer accepted");
            }
            DiagnosticEvent::PeerRemoved {
                connection,
                peer,
                remaining,
            } => {
                info!(connection = %connection, peer = %peer, remaining, "peer removed from chain");
            }
            DiagnosticEvent::AcceptFailed { connection, error } => {
                warn!(connection = %connection, code = error.code(), error = %error, "accept failed");
            }
            DiagnosticEvent::PollSendFailed { connection } => {
                warn!(connection = %connection, "couldn't send polling message");
            }
            DiagnosticEvent::Stopped {
                connection,
                description,
            } => {
                info!(connection = %connection, description, "stopped");
            }
            DiagnosticEvent::StoppingAll { count } => {
                info!(count, "stopping all connections");
            }
        }
    }
}
