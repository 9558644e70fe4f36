//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义套接字层对外暴露的错误语义，并为每类底层操作分配稳定错误码
//!   （`spark.socket.*`），便于日志检索与告警聚合；
//! - 运行期的连接/收发失败不会以 `Result` 形式抛给调用方，而是经
//!   [`DiagnosticHook`](crate::diagnostics::DiagnosticHook) 上报；只有构造期错误
//!   （绑定、配置）才会直接返回。
//!
//! ## 设计要求（What）
//! - 所有错误派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - [`SocketError::category`] 依据 `io::ErrorKind` 给出粗粒度分类，决定诊断日志级别。

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.socket.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.socket.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.socket.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.socket.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.socket.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.socket.configure_failed",
    message: "socket configure",
};
pub(crate) const UDP_BIND: OperationKind = OperationKind {
    code: "spark.socket.udp.bind_failed",
    message: "udp bind",
};
pub(crate) const UDP_SEND: OperationKind = OperationKind {
    code: "spark.socket.udp.send_failed",
    message: "udp send",
};
pub(crate) const UDP_RECEIVE: OperationKind = OperationKind {
    code: "spark.socket.udp.receive_failed",
    message: "udp receive",
};

/// 套接字层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合绑定、建连、读写与配置解析等路径的失败，使调用方只需面对一种错误类型；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可跨线程传递给诊断钩子；
/// - **设计权衡 (Trade-offs)**：`Io` 变体保留原始 `io::Error`，因此类型不可 `Clone`；
///   诊断钩子以引用方式接收错误。
#[derive(Debug, Error)]
pub enum SocketError {
    /// 底层 IO 操作失败。
    #[error("{}: {source}", .op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },

    /// 目标主机名无法解析出任何地址。
    #[error("failed to resolve `{host}:{port}` to a socket address")]
    Resolve { host: String, port: u16 },

    /// 对端在读循环中有序关闭了连接（读到 0 字节）。
    #[error("peer {peer} closed the connection")]
    PeerClosed { peer: SocketAddr },

    /// 配置取值非法。
    #[error("invalid socket configuration: {0}")]
    InvalidConfig(String),

    /// 配置文本无法解析为 TOML。
    #[error("failed to parse socket configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// 配置文件读取失败。
    #[error("failed to read socket configuration from `{path}`: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// 错误的粗粒度分类，决定诊断级别与是否值得重试。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// 暂时性失败，重连/重试有望恢复。
    Retryable,
    /// 对端关闭或重置了连接。
    PeerClosed,
    /// 操作超时。
    Timeout,
    /// 重试无益，需要人工介入或重建对象。
    NonRetryable,
}

impl SocketError {
    /// 返回稳定错误码，用于日志字段与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::Io { op, .. } => op.code,
            SocketError::Resolve { .. } => "spark.socket.resolve_failed",
            SocketError::PeerClosed { .. } => "spark.socket.peer_closed",
            SocketError::InvalidConfig(_) => "spark.socket.config.invalid",
            SocketError::ConfigParse(_) => "spark.socket.config.parse_failed",
            SocketError::ConfigRead { .. } => "spark.socket.config.read_failed",
        }
    }

    /// 对错误进行分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::Io { source, .. } => categorize_io_error(source),
            SocketError::Resolve { .. } => ErrorCategory::Retryable,
            SocketError::PeerClosed { .. } => ErrorCategory::PeerClosed,
            SocketError::InvalidConfig(_)
            | SocketError::ConfigParse(_)
            | SocketError::ConfigRead { .. } => ErrorCategory::NonRetryable,
        }
    }
}

/// 将 IO 错误映射为 [`SocketError::Io`]。
pub(crate) fn map_io_error(op: OperationKind, source: io::Error) -> SocketError {
    SocketError::Io { op, source }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ErrorCategory::Timeout,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => ErrorCategory::PeerClosed,
        ErrorKind::ConnectionRefused
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::Interrupted
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}
