//! # client：自动重连的 TCP 客户端
//!
//! ## 状态流转（What）
//! `disconnected → connecting → connected`；读写失败后若允许重连则回到 `connecting`，
//! 否则停在 `disconnected`；任意状态下调用 `stop()` 进入终态 `stopped`。
//!
//! ## 线程模型（How）
//! - 建连线程：解析目标地址并按 [`ReconnectBackoff`] 重试，直到成功或被停止；
//!   退避等待可被 `stop()` 立即打断；
//! - 读线程：每次成功建连启动一个，持有流的克隆句柄阻塞读取；
//! - `send` 在调用线程上同步写，写句柄本身即发送锁。
//!
//! ## 代际（generation）
//! - 每次建连递增代际号，读线程携带自己的代际；旧连接的读线程在失败时发现代际已过期，
//!   直接退出，不会把新连接误标为断开。

use std::{
    fmt,
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::{
    backoff::ReconnectBackoff,
    connection::{Connection, ConnectionCore},
    context::SocketContext,
    diagnostics::DiagnosticEvent,
    error::{CONFIGURE, CONNECT, READ, SocketError, WRITE, map_io_error},
    matcher::StateMachine,
    registry::{ConnectionId, ManagedConnection},
};

/// 出站 TCP 连接，断线后自动重连。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 调用方只关心“把字节发给某个 host:port”，不想处理断线、重连与读循环；
///
/// ## 契约 (What)
/// - 构造即开始建连，无需显式启动；
/// - `send` 在未连接且未在建连时触发一次建连，但不等待其完成：此时没有可用的流，
///   返回 `false`；
/// - 句柄可廉价克隆，所有克隆指向同一连接；丢弃句柄不会停止连接，需显式 `stop()`
///   或 [`SocketContext::stop_all`]。
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    core: ConnectionCore,
    host: String,
    port: u16,
    reconnect: AtomicBool,
    connect_lock: Mutex<()>,
    writer: Mutex<Option<TcpStream>>,
    /// 当前流的 (本端, 对端) 地址。
    addrs: Mutex<Option<(SocketAddr, SocketAddr)>>,
    generation: AtomicU64,
}

impl TcpClient {
    /// 创建客户端并立即在后台开始建连。
    pub fn connect(ctx: &SocketContext, host: impl Into<String>, port: u16) -> Self {
        let inner = Arc::new(ClientInner {
            core: ConnectionCore::new(ctx),
            host: host.into(),
            port,
            reconnect: AtomicBool::new(ctx.config().reconnect),
            connect_lock: Mutex::new(()),
            writer: Mutex::new(None),
            addrs: Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        ctx.registry().register(inner.clone());
        inner.connect();
        Self { inner }
    }

    /// 目标地址，形如 `host:port`。
    pub fn destination(&self) -> String {
        self.inner.target()
    }

    /// 当前连接的对端地址；未连接时为 `None`。
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.current_addrs().map(|(_, peer)| peer)
    }

    /// 当前连接的本端地址，即服务端看到的对端地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.current_addrs().map(|(local, _)| local)
    }

    pub fn set_reconnect(&self, enabled: bool) {
        self.inner.reconnect.store(enabled, Ordering::Release);
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.inner.reconnect.load(Ordering::Acquire)
    }

    /// 若既未连接也未在建连，则在后台发起一次建连。
    pub fn reconnect_now(&self) {
        self.inner.connect();
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("id", &self.inner.core.id())
            .field("destination", &self.inner.target())
            .field("connected", &self.inner.core.is_connected())
            .field("connecting", &self.inner.core.is_connecting())
            .field("stopped", &self.inner.core.is_stopped())
            .finish()
    }
}

impl Connection for TcpClient {
    fn id(&self) -> ConnectionId {
        self.inner.core.id()
    }

    fn send(&self, data: &[u8]) -> bool {
        self.inner.send(data)
    }

    fn stop(&self) {
        self.inner.shutdown();
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn is_connecting(&self) -> bool {
        self.inner.core.is_connecting()
    }

    fn is_stopped(&self) -> bool {
        self.inner.core.is_stopped()
    }

    fn set_on_receive<F>(&self, callback: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.inner.core.set_on_receive(Arc::new(callback));
    }

    fn clear_on_receive(&self) {
        self.inner.core.clear_on_receive();
    }

    fn poll<M, F>(&self, request: &[u8], timeout: Duration, factory: F) -> Option<M>
    where
        M: StateMachine<u8> + Send + 'static,
        F: FnMut() -> Option<M> + Send + 'static,
    {
        self.inner
            .core
            .poll_with(request, timeout, factory, |request| self.inner.send(request))
    }
}

impl ClientInner {
    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn current_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        if self.core.is_connected() {
            *self.addrs.lock()
        } else {
            None
        }
    }

    /// 幂等地发起建连：已停止、正在建连或已连接时不做任何事。
    fn connect(self: &Arc<Self>) {
        {
            let _attempt = self.connect_lock.lock();
            if self.core.is_stopped() || self.core.is_connecting() || self.core.is_connected() {
                return;
            }
            self.core.set_connecting(true);
        }
        let target = self.target();
        self.core.emit(&DiagnosticEvent::ConnectStarted {
            connection: self.core.id(),
            target: &target,
        });

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("spark-socket-connect-{}", self.core.id().get()))
            .spawn(move || inner.connect_loop());
        if let Err(error) = spawned {
            self.core.set_connecting(false);
            let error = map_io_error(CONNECT, error);
            self.core.emit(&DiagnosticEvent::ConnectFailed {
                connection: self.core.id(),
                attempt: 1,
                retry_in: Duration::ZERO,
                error: &error,
            });
        }
    }

    fn connect_loop(self: Arc<Self>) {
        let mut backoff = ReconnectBackoff::new(&self.core.context().config().reconnect_backoff);
        while !self.core.is_stopped() {
            match self.dial().and_then(|stream| self.establish(stream)) {
                // establish 已清除 connecting；此后读线程可能已经发起了新的建连。
                Ok(()) => return,
                Err(error) => {
                    let retry_in = backoff.next_delay();
                    self.core.emit(&DiagnosticEvent::ConnectFailed {
                        connection: self.core.id(),
                        attempt: backoff.failures(),
                        retry_in,
                        error: &error,
                    });
                    if self.core.wait_for_stop(retry_in) {
                        break;
                    }
                }
            }
        }
        self.core.set_connecting(false);
    }

    fn dial(&self) -> Result<TcpStream, SocketError> {
        let resolve_failed = || SocketError::Resolve {
            host: self.host.clone(),
            port: self.port,
        };
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| resolve_failed())?;
        let timeout = self.core.context().config().connect_timeout();

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.map_or_else(resolve_failed, |error| map_io_error(CONNECT, error)))
    }

    /// 配置新流、替换写句柄并启动读线程。
    fn establish(self: &Arc<Self>, stream: TcpStream) -> Result<(), SocketError> {
        let config = self.core.context().config();
        stream
            .set_write_timeout(config.write_timeout())
            .and_then(|()| stream.set_nodelay(config.nodelay))
            .map_err(|error| map_io_error(CONFIGURE, error))?;
        let peer = stream
            .peer_addr()
            .map_err(|error| map_io_error(CONNECT, error))?;
        let local = stream
            .local_addr()
            .map_err(|error| map_io_error(CONNECT, error))?;
        let reader = stream
            .try_clone()
            .map_err(|error| map_io_error(CONFIGURE, error))?;

        let generation = {
            let mut writer = self.writer.lock();
            if self.core.is_stopped() {
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
            if let Some(previous) = writer.replace(stream) {
                let _ = previous.shutdown(Shutdown::Both);
            }
            *self.addrs.lock() = Some((local, peer));
            self.core.set_connected(true);
            self.core.set_connecting(false);
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        self.core.emit(&DiagnosticEvent::Connected {
            connection: self.core.id(),
            peer,
        });

        let inner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("spark-socket-read-{}", self.core.id().get()))
            .spawn(move || inner.read_loop(reader, peer, generation))
            .map(|_| ())
            .map_err(|error| {
                self.drop_stream(generation);
                self.core.set_connecting(true);
                map_io_error(READ, error)
            })
    }

    fn read_loop(self: Arc<Self>, mut reader: TcpStream, peer: SocketAddr, generation: u64) {
        let size = self.core.context().config().receive_buffer_size;
        let mut buffer = BytesMut::with_capacity(size);
        let error = loop {
            buffer.resize(size, 0);
            match reader.read(&mut buffer[..]) {
                Ok(0) => break SocketError::PeerClosed { peer },
                Ok(read) => {
                    let chunk = buffer.split_to(read).freeze();
                    self.core.deliver(chunk, peer);
                }
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => break map_io_error(READ, error),
            }
        };

        if self.core.is_stopped() || !self.drop_stream(generation) {
            return;
        }
        self.core.emit(&DiagnosticEvent::ReadFailed {
            connection: self.core.id(),
            peer,
            error: &error,
        });
        if self.reconnect.load(Ordering::Acquire) {
            self.core.emit(&DiagnosticEvent::Reconnecting {
                connection: self.core.id(),
            });
            self.connect();
        }
    }

    /// 若 `generation` 仍是当前代际，则丢弃写句柄并标记断开；返回是否执行了丢弃。
    fn drop_stream(&self, generation: u64) -> bool {
        let mut writer = self.writer.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        if let Some(stream) = writer.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.core.set_connected(false);
        true
    }

    fn send(self: &Arc<Self>, data: &[u8]) -> bool {
        if self.core.is_stopped() {
            return false;
        }
        if !self.core.is_connected() && !self.core.is_connecting() {
            self.connect();
        }

        let mut writer = self.writer.lock();
        let Some(stream) = writer.as_mut() else {
            return false;
        };
        if !self.core.is_connected() {
            return false;
        }
        let error = match stream.write_all(data) {
            Ok(()) => return true,
            Err(error) => map_io_error(WRITE, error),
        };
        // 关闭流使读线程退出，由读线程负责按策略重连。
        let _ = stream.shutdown(Shutdown::Both);
        self.core.set_connected(false);
        let peer = self.addrs.lock().map(|(_, peer)| peer);
        drop(writer);

        self.core.emit(&DiagnosticEvent::SendFailed {
            connection: self.core.id(),
            peer,
            error: &error,
        });
        false
    }

    fn shutdown(&self) {
        if !self.core.begin_stop() {
            return;
        }
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let description = self.describe();
        self.core.emit(&DiagnosticEvent::Stopped {
            connection: self.core.id(),
            description: &description,
        });
    }
}

impl ManagedConnection for ClientInner {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn describe(&self) -> String {
        format!("tcp client -> {}", self.target())
    }

    fn stop(&self) {
        self.shutdown();
    }
}
