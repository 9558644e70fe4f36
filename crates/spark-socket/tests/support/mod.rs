//! 集成测试共用的等待、收集与诊断记录工具。
#![allow(dead_code)]

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use spark_socket::{
    BackoffConfig, DiagnosticEvent, DiagnosticHook, DiagnosticKind, SocketConfig, SocketContext,
    TracingDiagnostics,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// 轮询 `condition` 直到为真或超时，返回最终结果。
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// 退避很短、便于测试快速重连的配置。
pub fn fast_config() -> SocketConfig {
    SocketConfig {
        reconnect_backoff: BackoffConfig {
            initial_ms: 5,
            max_ms: 50,
            multiplier: 2,
        },
        ..SocketConfig::default()
    }
}

/// 记录全部诊断事件的种类，同时转发给 `tracing`。
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<DiagnosticKind>>>,
}

impl Recorder {
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.events.lock().iter().filter(|seen| **seen == kind).count()
    }
}

impl DiagnosticHook for Recorder {
    fn record(&self, event: &DiagnosticEvent<'_>) {
        self.events.lock().push(event.kind());
        TracingDiagnostics.record(event);
    }
}

pub fn recording_context(config: SocketConfig) -> Result<(SocketContext, Recorder)> {
    let recorder = Recorder::default();
    let ctx = SocketContext::with_diagnostics(config, recorder.clone())
        .context("测试配置应通过校验")?;
    Ok((ctx, recorder))
}

/// 累积收到的字节。
#[derive(Clone, Default)]
pub struct Collected {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Collected {
    pub fn sink(&self) -> impl Fn(Bytes) + Send + Sync + 'static {
        let bytes = Arc::clone(&self.bytes);
        move |chunk: Bytes| bytes.lock().extend_from_slice(&chunk)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    pub fn wait_for(&self, expected: &[u8]) -> bool {
        wait_until(|| self.bytes.lock().as_slice() == expected)
    }
}

/// 找一个当前无人监听的回环端口。
pub fn unused_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("绑定临时端口")?;
    let addr: SocketAddr = listener.local_addr().context("读取临时端口")?;
    Ok(addr.port())
}
