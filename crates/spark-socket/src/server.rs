//! # server：自愈的对端连接链
//!
//! ## 意图（Why）
//! - 一个监听端口上接受任意数量的对端，并把它们作为一个可寻址的整体暴露：
//!   广播、按地址单发、按地址关闭、轮询；
//! - 某个对端断开时只摘除它自己的节点，兄弟节点不受影响。
//!
//! ## 结构（How）
//! - 链是一张下标竞技场（arena）上的双向索引链表：每个槽位带代际号，节点标识
//!   [`NodeId`] 同时记录下标与代际，槽位复用后旧标识自然失效；
//! - 接入时追加到链尾，读失败时按标识摘除（父节点的 child 直接指向被摘节点的 child），
//!   所有结构变更都在同一把链锁内完成；
//! - 遍历顺序即接入顺序（root → tail）。
//!
//! ## 监听器失败
//! - `accept` 出错只上报诊断并退避等待，链上已有的对端继续服务；监听器只在 `stop()`
//!   时关闭。

use std::{
    fmt,
    io::{Read, Write},
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
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
    error::{ACCEPT, BIND, CONFIGURE, READ, SocketError, WRITE, map_io_error},
    matcher::StateMachine,
    registry::{ConnectionId, ManagedConnection},
};

/// 链上节点的代际标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct NodeId {
    index: usize,
    generation: u64,
}

struct ChainNode {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
    parent: Option<usize>,
    child: Option<usize>,
}

struct Slot {
    generation: u64,
    node: Option<ChainNode>,
}

/// 对端节点链。
#[derive(Default)]
struct Chain {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Chain {
    fn append(&mut self, peer: SocketAddr, stream: TcpStream) -> NodeId {
        let node = ChainNode {
            peer,
            stream: Mutex::new(stream),
            parent: self.tail,
            child: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };
        match self.tail {
            Some(tail) => {
                if let Some(previous) = self.slots[tail].node.as_mut() {
                    previous.child = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        NodeId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// 摘除节点并返回它；标识已失效时返回 `None`。
    fn splice(&mut self, id: NodeId) -> Option<ChainNode> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation += 1;
        self.free.push(id.index);

        match node.parent {
            Some(parent) => {
                if let Some(parent) = self.slots[parent].node.as_mut() {
                    parent.child = node.child;
                }
            }
            None => self.head = node.child,
        }
        match node.child {
            Some(child) => {
                if let Some(child) = self.slots[child].node.as_mut() {
                    child.parent = node.parent;
                }
            }
            None => self.tail = node.parent,
        }
        self.len -= 1;
        Some(node)
    }

    fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            cursor: self.head,
        }
    }

    fn find(&self, peer: SocketAddr) -> Option<NodeId> {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &self.slots[index];
            let node = slot.node.as_ref()?;
            if node.peer == peer {
                return Some(NodeId {
                    index,
                    generation: slot.generation,
                });
            }
            cursor = node.child;
        }
        None
    }

    fn get(&self, id: NodeId) -> Option<&ChainNode> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    /// 按 root → tail 顺序取出全部节点并清空链。
    fn drain(&mut self) -> Vec<ChainNode> {
        let mut nodes = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index];
            let Some(node) = slot.node.take() else {
                break;
            };
            slot.generation += 1;
            self.free.push(index);
            cursor = node.child;
            nodes.push(node);
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        nodes
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct ChainIter<'a> {
    chain: &'a Chain,
    cursor: Option<usize>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a ChainNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.chain.slots.get(self.cursor?)?.node.as_ref()?;
        self.cursor = node.child;
        Some(node)
    }
}

/// 多对端 TCP 服务端。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 构造即开始接受连接；对端数据统一交给服务端上安装的回调，带地址的回调可区分来源；
/// - `send` 广播给全部对端，遍历完成即返回 `true`，与单个对端的写结果无关；
///   服务端已停止时返回 `false`；写失败的对端（广播或单发）会被摘除；
/// - `is_connected`：链上至少有一个对端；`is_connecting`：接受循环仍在运行；
/// - `stop` 先关闭全部对端，再关闭监听器，幂等。
///
/// ## 风险提示 (Trade-offs)
/// - 广播在链锁内逐个同步写，单个对端写阻塞（至多 `write_timeout_ms`）会推迟其他对端
///   与新连接的接入。
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    core: ConnectionCore,
    local_addr: SocketAddr,
    chain: Mutex<Chain>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    listener_closed: AtomicBool,
}

impl TcpServer {
    /// 在所有 IPv4 地址的 `port` 上监听；`port = 0` 由系统分配。
    pub fn bind(ctx: &SocketContext, port: u16) -> Result<Self, SocketError> {
        Self::bind_addr(ctx, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// 在指定地址上监听。
    pub fn bind_addr(ctx: &SocketContext, addr: SocketAddr) -> Result<Self, SocketError> {
        let listener = open_listener(addr, ctx.config().listen_backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| map_io_error(BIND, error))?;

        let inner = Arc::new(ServerInner {
            core: ConnectionCore::new(ctx),
            local_addr,
            chain: Mutex::new(Chain::default()),
            acceptor: Mutex::new(None),
            listener_closed: AtomicBool::new(false),
        });
        inner.core.set_connecting(true);

        let acceptor = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("spark-socket-accept-{}", inner.core.id().get()))
            .spawn(move || acceptor.accept_loop(listener))
            .map_err(|error| map_io_error(ACCEPT, error))?;
        *inner.acceptor.lock() = Some(handle);

        ctx.registry().register(inner.clone());
        Ok(Self { inner })
    }

    /// 监听器实际绑定的地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// 当前全部对端地址，按接入顺序（root → tail）排列。
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.inner.chain.lock().iter().map(|node| node.peer).collect()
    }

    /// 只发给地址为 `peer` 的对端；找到且写成功时返回 `true`。
    pub fn send_to(&self, data: &[u8], peer: SocketAddr) -> bool {
        self.inner.send_to(data, peer)
    }

    /// 关闭一个对端并将其节点摘除；找不到时返回 `false`。
    pub fn close_peer(&self, peer: SocketAddr) -> bool {
        self.inner.close_peer(peer)
    }

    /// 与 [`Connection::poll`] 相同，但请求只发给 `peer`。
    ///
    /// 匹配器仍会看到所有对端的入站字节。
    pub fn poll_peer<M, F>(
        &self,
        request: &[u8],
        timeout: Duration,
        factory: F,
        peer: SocketAddr,
    ) -> Option<M>
    where
        M: StateMachine<u8> + Send + 'static,
        F: FnMut() -> Option<M> + Send + 'static,
    {
        self.inner
            .core
            .poll_with(request, timeout, factory, |request| {
                self.inner.send_to(request, peer)
            })
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

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("id", &self.inner.core.id())
            .field("local_addr", &self.inner.local_addr)
            .field("peers", &self.inner.chain.lock().len())
            .field("stopped", &self.inner.core.is_stopped())
            .finish()
    }
}

impl Connection for TcpServer {
    fn id(&self) -> ConnectionId {
        self.inner.core.id()
    }

    fn send(&self, data: &[u8]) -> bool {
        self.inner.broadcast(data)
    }

    fn stop(&self) {
        self.inner.shutdown();
    }

    fn is_connected(&self) -> bool {
        !self.inner.chain.lock().is_empty()
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
            .poll_with(request, timeout, factory, |request| {
                self.inner.broadcast(request)
            })
    }
}

fn open_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, SocketError> {
    let bind_failed = |error| map_io_error(BIND, error);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_failed)?;
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.listen(backlog).map_err(bind_failed)?;
    Ok(socket.into())
}

impl ServerInner {
    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let backoff = self.core.context().config().accept_error_backoff();
        while !self.core.is_stopped() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.core.is_stopped() {
                        let _ = stream.shutdown(Shutdown::Both);
                        break;
                    }
                    self.admit(stream, peer);
                }
                Err(error) => {
                    if self.core.is_stopped() {
                        break;
                    }
                    let error = map_io_error(ACCEPT, error);
                    self.core.emit(&DiagnosticEvent::AcceptFailed {
                        connection: self.core.id(),
                        error: &error,
                    });
                    if self.core.wait_for_stop(backoff) {
                        break;
                    }
                }
            }
        }
        self.core.set_connecting(false);
        self.listener_closed.store(true, Ordering::Release);
    }

    /// 把新对端挂到链尾并启动它的读线程。
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let config = self.core.context().config();
        let prepared = stream
            .set_write_timeout(config.write_timeout())
            .and_then(|()| stream.set_nodelay(config.nodelay))
            .and_then(|()| stream.try_clone());
        let reader = match prepared {
            Ok(reader) => reader,
            Err(error) => {
                let error = map_io_error(CONFIGURE, error);
                self.core.emit(&DiagnosticEvent::AcceptFailed {
                    connection: self.core.id(),
                    error: &error,
                });
                return;
            }
        };

        let id = {
            let mut chain = self.chain.lock();
            if self.core.is_stopped() {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            chain.append(peer, stream)
        };
        self.core.emit(&DiagnosticEvent::PeerAccepted {
            connection: self.core.id(),
            peer,
        });

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("spark-socket-peer-{}", self.core.id().get()))
            .spawn(move || inner.read_loop(reader, peer, id));
        if let Err(error) = spawned {
            let error = map_io_error(READ, error);
            self.remove(id, peer, &error);
        }
    }

    fn read_loop(self: Arc<Self>, mut reader: TcpStream, peer: SocketAddr, id: NodeId) {
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
        if !self.core.is_stopped() {
            self.remove(id, peer, &error);
        }
    }

    /// 摘除读失败的节点；节点已被 `close_peer` 或 `stop` 摘除时静默返回。
    fn remove(&self, id: NodeId, peer: SocketAddr, error: &SocketError) {
        let (node, remaining) = {
            let mut chain = self.chain.lock();
            let node = chain.splice(id);
            (node, chain.len())
        };
        let Some(node) = node else {
            return;
        };
        let _ = node.stream.lock().shutdown(Shutdown::Both);
        self.core.emit(&DiagnosticEvent::ReadFailed {
            connection: self.core.id(),
            peer,
            error,
        });
        self.core.emit(&DiagnosticEvent::PeerRemoved {
            connection: self.core.id(),
            peer,
            remaining,
        });
    }

    fn broadcast(&self, data: &[u8]) -> bool {
        if self.core.is_stopped() {
            return false;
        }
        let failures: Vec<(SocketAddr, SocketError)> = {
            let chain = self.chain.lock();
            chain
                .iter()
                .filter_map(|node| {
                    node.stream
                        .lock()
                        .write_all(data)
                        .err()
                        .map(|error| (node.peer, map_io_error(WRITE, error)))
                })
                .collect()
        };
        for (peer, error) in &failures {
            self.report_send_failure(*peer, error);
        }
        true
    }

    fn send_to(&self, data: &[u8], peer: SocketAddr) -> bool {
        if self.core.is_stopped() {
            return false;
        }
        let outcome = {
            let chain = self.chain.lock();
            let Some(node) = chain.find(peer).and_then(|id| chain.get(id)) else {
                return false;
            };
            node.stream.lock().write_all(data)
        };
        match outcome {
            Ok(()) => true,
            Err(error) => {
                self.report_send_failure(peer, &map_io_error(WRITE, error));
                false
            }
        }
    }

    /// 上报写失败并摘除该对端；它的读线程随后因流被关闭而静默退出。
    fn report_send_failure(&self, peer: SocketAddr, error: &SocketError) {
        self.core.emit(&DiagnosticEvent::SendFailed {
            connection: self.core.id(),
            peer: Some(peer),
            error,
        });
        self.close_peer(peer);
    }

    fn close_peer(&self, peer: SocketAddr) -> bool {
        let (node, remaining) = {
            let mut chain = self.chain.lock();
            let node = chain.find(peer).and_then(|id| chain.splice(id));
            (node, chain.len())
        };
        let Some(node) = node else {
            return false;
        };
        let _ = node.stream.lock().shutdown(Shutdown::Both);
        self.core.emit(&DiagnosticEvent::PeerRemoved {
            connection: self.core.id(),
            peer,
            remaining,
        });
        true
    }

    fn shutdown(&self) {
        if !self.core.begin_stop() {
            return;
        }
        let nodes = self.chain.lock().drain();
        for node in &nodes {
            let _ = node.stream.lock().shutdown(Shutdown::Both);
        }
        self.close_listener();

        let description = self.describe();
        self.core.emit(&DiagnosticEvent::Stopped {
            connection: self.core.id(),
            description: &description,
        });
    }

    /// 通过一次自连接唤醒阻塞在 `accept` 上的线程，并等待其退出以释放端口。
    ///
    /// 在接受线程自身上调用（例如诊断钩子里停止服务端）时不等待。
    fn close_listener(&self) {
        let Some(handle) = self.acceptor.lock().take() else {
            return;
        };
        if self.listener_closed.load(Ordering::Acquire) {
            let _ = handle.join();
            return;
        }
        let timeout = self.core.context().config().connect_timeout();
        let woke = TcpStream::connect_timeout(&wake_addr(self.local_addr), timeout).is_ok();
        if woke && handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

/// 通配地址不可作为连接目标，映射到同族的回环地址。
pub(crate) fn wake_addr(local: SocketAddr) -> SocketAddr {
    match local {
        SocketAddr::V4(addr) if addr.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
        }
        SocketAddr::V6(addr) if addr.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, addr.port()))
        }
        other => other,
    }
}

impl ManagedConnection for ServerInner {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn describe(&self) -> String {
        format!("tcp server on {}", self.local_addr)
    }

    fn stop(&self) {
        self.shutdown();
    }
}
