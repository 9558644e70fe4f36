//! # connection：连接共享的生命周期与接收分发
//!
//! ## 意图（Why）
//! - 客户端、服务端与 UDP 端点共享同一组状态位（connected / connecting / stopped）、
//!   同一套接收回调槽位与同一条“发送请求并阻塞等待匹配应答”的轮询路径；
//! - [`ConnectionCore`] 把这些共性集中在一处，具体连接类型只负责各自的套接字管理。
//!
//! ## 接收槽位（How）
//! - 槽位是一个带标签的变体 `{User, Poll(tap)}`，与两个用户回调一起放在同一把互斥锁后；
//! - 轮询期间仅字节回调被替换为匹配器入口；带地址的回调照常触发；
//! - 分发时先在锁内克隆出目标，再在锁外调用，用户回调执行期间不持有任何内部锁。
//!
//! ## 风险提示（Trade-offs）
//! - 轮询期间到达、但不属于应答的字节只进入匹配器，不会再交给用户字节回调。

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::{
    context::SocketContext,
    diagnostics::DiagnosticEvent,
    matcher::{StateMachine, StateMachineManager},
    registry::ConnectionId,
};

/// 字节回调。
pub type ReceiveCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// 带来源地址的字节回调。
pub type ReceiveFromCallback = Arc<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

/// 所有连接类型共享的对外能力集。
///
/// # 教案式注释
/// - **契约 (What)**：
///   - `stop` 为终态且幂等，之后 `send` 恒为 `false`、`poll` 恒为 `None`；
///   - 运行期失败不会 panic，也不会以 `Result` 返回，而是上报给上下文的诊断钩子；
/// - **对象安全 (Trade-offs)**：泛型方法带 `Self: Sized` 约束，`dyn Connection`
///   仍可用于统一的收发与生命周期管理。
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// 同步发送；成功写出返回 `true`。
    fn send(&self, data: &[u8]) -> bool;

    fn stop(&self);

    fn is_connected(&self) -> bool;

    fn is_connecting(&self) -> bool;

    fn is_stopped(&self) -> bool;

    /// 安装字节回调，替换之前的回调。
    fn set_on_receive<F>(&self, callback: F)
    where
        F: Fn(Bytes) + Send + Sync + 'static,
        Self: Sized;

    fn clear_on_receive(&self);

    /// 发送 `request` 并阻塞等待第一个完成的匹配，超时返回 `None`。
    ///
    /// `factory` 在每个入站字节上被调用一次，用于产生以该字节为起点的候选状态机。
    fn poll<M, F>(&self, request: &[u8], timeout: Duration, factory: F) -> Option<M>
    where
        M: StateMachine<u8> + Send + 'static,
        F: FnMut() -> Option<M> + Send + 'static,
        Self: Sized;
}

/// 轮询期间接管字节流的匹配器入口。
trait PollTap: Send + Sync {
    fn deliver(&self, chunk: &Bytes);
}

enum ReceiveSink {
    User,
    Poll(Arc<dyn PollTap>),
}

struct SinkState {
    on_receive: Option<ReceiveCallback>,
    on_receive_from: Option<ReceiveFromCallback>,
    active: ReceiveSink,
}

/// 一次轮询的匹配器与结果槽。仅保留第一个完成的匹配。
struct PollSlot<M, F> {
    manager: StateMachineManager<M, F, u8>,
    result: Mutex<Option<M>>,
    ready: Condvar,
}

impl<M, F> PollTap for PollSlot<M, F>
where
    M: StateMachine<u8> + Send,
    F: FnMut() -> Option<M> + Send,
{
    fn deliver(&self, chunk: &Bytes) {
        let mut matches = self.manager.feed(chunk.iter().copied());
        if matches.is_empty() {
            return;
        }
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(matches.swap_remove(0));
            self.ready.notify_all();
        }
    }
}

/// 离开轮询时把槽位恢复为用户回调，覆盖成功、超时与发送失败三种出口。
struct PollGuard<'a> {
    sinks: &'a Mutex<SinkState>,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.sinks.lock().active = ReceiveSink::User;
    }
}

/// 连接共享状态。
pub(crate) struct ConnectionCore {
    id: ConnectionId,
    context: SocketContext,
    connected: AtomicBool,
    connecting: AtomicBool,
    stopped: AtomicBool,
    sinks: Mutex<SinkState>,
    poll_lock: Mutex<()>,
    stop_flag: Mutex<bool>,
    stop_wakeup: Condvar,
}

impl ConnectionCore {
    pub(crate) fn new(context: &SocketContext) -> Self {
        Self {
            id: context.registry().allocate_id(),
            context: context.clone(),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            sinks: Mutex::new(SinkState {
                on_receive: None,
                on_receive_from: None,
                active: ReceiveSink::User,
            }),
            poll_lock: Mutex::new(()),
            stop_flag: Mutex::new(false),
            stop_wakeup: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn context(&self) -> &SocketContext {
        &self.context
    }

    pub(crate) fn emit(&self, event: &DiagnosticEvent<'_>) {
        self.context.emit(event);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub(crate) fn set_connecting(&self, value: bool) {
        self.connecting.store(value, Ordering::Release);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 进入终态。仅首次调用返回 `true`，调用方据此执行一次性的资源释放。
    ///
    /// 同时清除 connected / connecting，唤醒所有可中断等待，并从登记表注销。
    pub(crate) fn begin_stop(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.set_connected(false);
        self.set_connecting(false);
        *self.stop_flag.lock() = true;
        self.stop_wakeup.notify_all();
        self.context.registry().deregister(self.id);
        true
    }

    /// 等待至多 `duration`；期间若连接被停止则提前返回 `true`。
    ///
    /// `duration` 超出 `Instant` 表示范围时一直等到停止。
    pub(crate) fn wait_for_stop(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut stopped = self.stop_flag.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self
                        .stop_wakeup
                        .wait_until(&mut stopped, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.stop_wakeup.wait(&mut stopped),
            }
        }
        *stopped
    }

    pub(crate) fn set_on_receive(&self, callback: ReceiveCallback) {
        self.sinks.lock().on_receive = Some(callback);
    }

    pub(crate) fn clear_on_receive(&self) {
        self.sinks.lock().on_receive = None;
    }

    pub(crate) fn set_on_receive_from(&self, callback: ReceiveFromCallback) {
        self.sinks.lock().on_receive_from = Some(callback);
    }

    pub(crate) fn clear_on_receive_from(&self) {
        self.sinks.lock().on_receive_from = None;
    }

    /// 把一段入站字节交给当前槽位。
    pub(crate) fn deliver(&self, chunk: Bytes, source: SocketAddr) {
        let (user, tap, annotated) = {
            let sinks = self.sinks.lock();
            match &sinks.active {
                ReceiveSink::User => (
                    sinks.on_receive.clone(),
                    None,
                    sinks.on_receive_from.clone(),
                ),
                ReceiveSink::Poll(tap) => {
                    (None, Some(Arc::clone(tap)), sinks.on_receive_from.clone())
                }
            }
        };

        if let Some(tap) = tap {
            tap.deliver(&chunk);
        }
        if let Some(annotated) = annotated {
            annotated(chunk.clone(), source);
        }
        if let Some(user) = user {
            user(chunk);
        }
    }

    /// 阻塞轮询的公共实现，`send` 决定请求发往何处。
    ///
    /// # 教案式注释
    ///
    /// ## 逻辑 (How)
    /// 1. 获取轮询锁，同一连接上的并发轮询排队执行；
    /// 2. 以 `factory` 构造匹配器并把槽位切换为 `Poll`，`PollGuard` 负责在任何出口恢复；
    /// 3. 发送请求；失败则上报 `PollSendFailed` 并立即返回 `None`；
    /// 4. 在条件变量上等待第一个匹配，直到截止时间。
    ///
    /// ## 契约 (What)
    /// - 连接已停止时直接返回 `None`，不发送请求；
    /// - 停止不会中断正在进行的等待，轮询在匹配或超时后自然结束。
    pub(crate) fn poll_with<M, F, S>(
        &self,
        request: &[u8],
        timeout: Duration,
        factory: F,
        send: S,
    ) -> Option<M>
    where
        M: StateMachine<u8> + Send + 'static,
        F: FnMut() -> Option<M> + Send + 'static,
        S: FnOnce(&[u8]) -> bool,
    {
        let exclusive = self.poll_lock.lock();
        if self.is_stopped() {
            return None;
        }

        let slot = Arc::new(PollSlot {
            manager: StateMachineManager::new(factory),
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let tap: Arc<dyn PollTap> = slot.clone();
        self.sinks.lock().active = ReceiveSink::Poll(tap);
        let restore = PollGuard { sinks: &self.sinks };

        if !send(request) {
            drop(restore);
            drop(exclusive);
            self.emit(&DiagnosticEvent::PollSendFailed {
                connection: self.id,
            });
            return None;
        }

        // 超出 `Instant` 表示范围的超时视为无限等待。
        let deadline = Instant::now().checked_add(timeout);
        let mut result = slot.result.lock();
        while result.is_none() {
            match deadline {
                Some(deadline) => {
                    if slot.ready.wait_until(&mut result, deadline).timed_out() {
                        break;
                    }
                }
                None => slot.ready.wait(&mut result),
            }
        }
        result.take()
    }
}
