//! # udp：无连接数据报端点
//!
//! 与 TCP 连接共享生命周期、接收槽位与轮询路径，但没有重连，也没有对端链：
//! 每个数据报原样交给回调，`send` 发往构造时给定的默认目标。

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    connection::{Connection, ConnectionCore},
    context::SocketContext,
    diagnostics::DiagnosticEvent,
    error::{SocketError, UDP_BIND, UDP_RECEIVE, UDP_SEND, map_io_error},
    matcher::StateMachine,
    registry::{ConnectionId, ManagedConnection},
    server::wake_addr,
};

/// UDP 套接字选项。
///
/// - `broadcast`：是否允许向广播地址发送（`SO_BROADCAST`）；
/// - `reuse_address`：绑定前设置 `SO_REUSEADDR`。
#[derive(Clone, Debug, Default)]
pub struct UdpOptions {
    broadcast: bool,
    reuse_address: bool,
}

impl UdpOptions {
    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn reuse_address(&self) -> bool {
        self.reuse_address
    }
}

/// UDP 端点。
#[derive(Clone)]
pub struct UdpEndpoint {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    core: ConnectionCore,
    socket: UdpSocket,
    local_addr: SocketAddr,
    destination: Option<SocketAddr>,
    options: UdpOptions,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// 在所有 IPv4 地址的 `port` 上接收数据报，无默认目标。
    pub fn bind(ctx: &SocketContext, port: u16) -> Result<Self, SocketError> {
        Self::bind_with(
            ctx,
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            None,
            UdpOptions::default(),
        )
    }

    /// 绑定临时端口，并以 `host:port` 为默认目标。
    pub fn connect(ctx: &SocketContext, host: &str, port: u16) -> Result<Self, SocketError> {
        Self::connect_with(ctx, host, port, UdpOptions::default())
    }

    pub fn connect_with(
        ctx: &SocketContext,
        host: &str,
        port: u16,
        options: UdpOptions,
    ) -> Result<Self, SocketError> {
        let destination = (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| SocketError::Resolve {
                host: host.to_owned(),
                port,
            })?;
        let local = match destination {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        Self::bind_with(ctx, local, Some(destination), options)
    }

    /// 完整构造入口。
    pub fn bind_with(
        ctx: &SocketContext,
        addr: SocketAddr,
        destination: Option<SocketAddr>,
        options: UdpOptions,
    ) -> Result<Self, SocketError> {
        let socket = open_socket(addr, &options)?;
        let local_addr = socket
            .local_addr()
            .map_err(|error| map_io_error(UDP_BIND, error))?;
        let reader = socket
            .try_clone()
            .map_err(|error| map_io_error(UDP_BIND, error))?;

        let inner = Arc::new(UdpInner {
            core: ConnectionCore::new(ctx),
            socket,
            local_addr,
            destination,
            options,
            receiver: Mutex::new(None),
        });
        inner.core.set_connected(true);

        let receiver = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("spark-socket-udp-{}", inner.core.id().get()))
            .spawn(move || receiver.receive_loop(reader))
            .map_err(|error| map_io_error(UDP_RECEIVE, error))?;
        *inner.receiver.lock() = Some(handle);

        ctx.registry().register(inner.clone());
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.inner.destination
    }

    pub fn options(&self) -> &UdpOptions {
        &self.inner.options
    }

    /// 发往指定地址；整个数据报写出时返回 `true`。
    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> bool {
        self.inner.send_to(data, target)
    }

    pub fn set_on_receive_from<F>(&self, callback: F)
    where
        F: Fn(Bytes, SocketAddr) + Send + Sync + 'static,
    {
        self.inner.core.set_on_receive_from(Arc::new(callback));
    }

    pub fn clear_on_receive_from(&self) {
        self.inner.core.clear_on_receive_from();
    }
}

impl fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("id", &self.inner.core.id())
            .field("local_addr", &self.inner.local_addr)
            .field("destination", &self.inner.destination)
            .field("stopped", &self.inner.core.is_stopped())
            .finish()
    }
}

impl Connection for UdpEndpoint {
    fn id(&self) -> ConnectionId {
        self.inner.core.id()
    }

    /// 发往默认目标；没有默认目标时返回 `false`。
    fn send(&self, data: &[u8]) -> bool {
        match self.inner.destination {
            Some(target) => self.inner.send_to(data, target),
            None => false,
        }
    }

    fn stop(&self) {
        self.inner.shutdown();
    }

    fn is_connected(&self) -> bool {
        self.inner.core.is_connected()
    }

    fn is_connecting(&self) -> bool {
        false
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
            .poll_with(request, timeout, factory, |request| self.send(request))
    }
}

fn open_socket(addr: SocketAddr, options: &UdpOptions) -> Result<UdpSocket, SocketError> {
    let bind_failed = |error| map_io_error(UDP_BIND, error);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_failed)?;
    socket
        .set_reuse_address(options.reuse_address)
        .map_err(bind_failed)?;
    socket.set_broadcast(options.broadcast).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    Ok(socket.into())
}

impl UdpInner {
    fn receive_loop(self: Arc<Self>, reader: UdpSocket) {
        let size = self.core.context().config().receive_buffer_size;
        let backoff = self.core.context().config().accept_error_backoff();
        let mut buffer = BytesMut::with_capacity(size);
        loop {
            buffer.resize(size, 0);
            let received = reader.recv_from(&mut buffer[..]);
            if self.core.is_stopped() {
                break;
            }
            match received {
                Ok((read, source)) => {
                    let chunk = buffer.split_to(read).freeze();
                    self.core.deliver(chunk, source);
                }
                Err(error) => {
                    let error = map_io_error(UDP_RECEIVE, error);
                    self.core.emit(&DiagnosticEvent::ReadFailed {
                        connection: self.core.id(),
                        peer: self.local_addr,
                        error: &error,
                    });
                    if self.core.wait_for_stop(backoff) {
                        break;
                    }
                }
            }
        }
    }

    fn send_to(&self, data: &[u8], target: SocketAddr) -> bool {
        if self.core.is_stopped() {
            return false;
        }
        let error = match self.socket.send_to(data, target) {
            Ok(sent) if sent == data.len() => return true,
            Ok(_) => map_io_error(
                UDP_SEND,
                std::io::Error::new(std::io::ErrorKind::WriteZero, "datagram truncated"),
            ),
            Err(error) => map_io_error(UDP_SEND, error),
        };
        self.core.emit(&DiagnosticEvent::SendFailed {
            connection: self.core.id(),
            peer: Some(target),
            error: &error,
        });
        false
    }

    /// 向自身发送一个空数据报以唤醒阻塞的接收线程，再等待其退出。
    fn shutdown(&self) {
        if !self.core.begin_stop() {
            return;
        }
        if let Some(handle) = self.receiver.lock().take() {
            let woke = self.socket.send_to(&[], wake_addr(self.local_addr)).is_ok();
            if woke && handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        let description = self.describe();
        self.core.emit(&DiagnosticEvent::Stopped {
            connection: self.core.id(),
            description: &description,
        });
    }
}

impl ManagedConnection for UdpInner {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn describe(&self) -> String {
        match self.destination {
            Some(destination) => format!("udp {} -> {destination}", self.local_addr),
            None => format!("udp on {}", self.local_addr),
        }
    }

    fn stop(&self) {
        self.shutdown();
    }
}
