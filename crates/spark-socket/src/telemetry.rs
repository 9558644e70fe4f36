//! 进程级 `tracing` 订阅器安装入口。
//!
//! ## 意图（Why）
//! - 宿主程序（命令行工具、集成测试）只需调用一次 [`install`]，即可看到
//!   [`TracingDiagnostics`](crate::TracingDiagnostics) 输出的结构化事件；
//! - 过滤规则遵循 `RUST_LOG`，未设置时默认为 `spark_socket=info`。
//!
//! ## 契约（What）
//! - 重复调用返回 [`TelemetryError::AlreadyInstalled`]；
//! - 外部已设置全局订阅器时返回 [`TelemetryError::SubscriberAlreadySet`]，不会覆盖。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

const DEFAULT_FILTER: &str = "spark_socket=info";

/// 安装订阅器可能出现的错误。
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("spark-socket telemetry is already installed")]
    AlreadyInstalled,
    #[error("a global tracing subscriber has already been set")]
    SubscriberAlreadySet,
    #[error("failed to set the global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 订阅器。
pub fn install() -> Result<(), TelemetryError> {
    if INSTALLED.get().is_some() {
        return Err(TelemetryError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    tracing::subscriber::set_global_default(subscriber)?;

    INSTALLED
        .set(())
        .map_err(|_| TelemetryError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

