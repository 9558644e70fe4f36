use std::{fmt, sync::Arc};

use crate::{
    config::SocketConfig,
    diagnostics::{DiagnosticEvent, DiagnosticHook, TracingDiagnostics},
    error::SocketError,
    registry::ConnectionRegistry,
};

/// 套接字层的顶层上下文：连接登记表、诊断钩子与配置的唯一持有者。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 取代进程级全局登记表与全局日志钩子：宿主显式构造一个上下文，并在构造每个
///   连接时注入，测试之间因此互不干扰；
/// - [`SocketContext::stop_all`] 是显式的收尾入口。
///
/// ## 契约 (What)
/// - 克隆代价为一次 `Arc` 引用计数递增，所有克隆共享同一登记表；
/// - 构造时校验配置，运行期配置不可变。
#[derive(Clone)]
pub struct SocketContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: SocketConfig,
    registry: ConnectionRegistry,
    diagnostics: Arc<dyn DiagnosticHook>,
}

impl Default for SocketContext {
    fn default() -> Self {
        Self::from_parts(SocketConfig::default(), Arc::new(TracingDiagnostics))
    }
}

impl fmt::Debug for SocketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketContext")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl SocketContext {
    /// 使用给定配置与默认的 [`TracingDiagnostics`] 构造上下文。
    pub fn new(config: SocketConfig) -> Result<Self, SocketError> {
        Self::with_diagnostics(config, TracingDiagnostics)
    }

    /// 使用自定义诊断钩子构造上下文。
    pub fn with_diagnostics<H>(config: SocketConfig, hook: H) -> Result<Self, SocketError>
    where
        H: DiagnosticHook + 'static,
    {
        config.validate()?;
        Ok(Self::from_parts(config, Arc::new(hook)))
    }

    fn from_parts(config: SocketConfig, diagnostics: Arc<dyn DiagnosticHook>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                registry: ConnectionRegistry::new(),
                diagnostics,
            }),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub(crate) fn emit(&self, event: &DiagnosticEvent<'_>) {
        self.inner.diagnostics.record(event);
    }

    /// 停止当前登记的全部连接，返回被停止的连接数。
    pub fn stop_all(&self) -> usize {
        self.emit(&DiagnosticEvent::StoppingAll {
            count: self.inner.registry.len(),
        });
        self.inner.registry.stop_all()
    }
}
