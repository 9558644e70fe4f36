#![doc = r#"
# spark-socket

## 设计动机（Why）
- **定位**：在操作系统套接字之上提供一层“开箱即用”的连接封装：自动重连的 TCP 客户端、
  可接受任意数量对端并在对端断开时自愈的 TCP 服务端，以及无连接的 UDP 端点；
- **同步轮询**：入站数据以回调形式推送，[`Connection::poll`] 借助
  [`StateMachineManager`] 在推送流上识别完整应答，把“发请求、等应答”变为一次阻塞调用。

## 核心契约（What）
- 所有连接由 [`SocketContext`] 构造，上下文持有登记表、诊断钩子与 [`SocketConfig`]；
  [`SocketContext::stop_all`] 停止全部存活连接；
- 载荷是不透明字节序列，本 crate 不做分帧：一端写出的字节会按序、可能分多次地
  交给另一端的回调；
- 运行期失败（建连、读写）不会 panic 也不会以 `Result` 返回，而是以
  [`DiagnosticEvent`] 交给诊断钩子；只有构造期失败（绑定、配置）返回 [`SocketError`]。

## 实现策略（How）
- **线程模型**：每条连接一个读线程，客户端建连与服务端接受各一个后台线程；
  `poll` 在调用线程上限时阻塞；
- **服务端对端链**：下标竞技场上的链表，节点带代际号，摘除即下标重连；
- **重连**：有上限的指数退避，等待可被 `stop()` 立即打断。

## 风险与考量（Trade-offs）
- 丢弃句柄不会停止连接；宿主应显式调用 `stop()` 或 `stop_all()`；
- `poll` 会占用调用线程至多 `timeout`。
"#]

mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod matcher;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod udp;

pub use client::TcpClient;
pub use config::{BackoffConfig, SocketConfig};
pub use connection::{Connection, ReceiveCallback, ReceiveFromCallback};
pub use context::SocketContext;
pub use diagnostics::{DiagnosticEvent, DiagnosticHook, DiagnosticKind, TracingDiagnostics};
pub use error::{ErrorCategory, OperationKind, SocketError};
pub use matcher::{StateMachine, StateMachineManager};
pub use registry::{ConnectionId, ConnectionRegistry, ManagedConnection};
pub use server::TcpServer;
pub use udp::{UdpEndpoint, UdpOptions};
