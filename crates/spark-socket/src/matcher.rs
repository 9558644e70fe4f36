//! # matcher：多起点增量状态机匹配
//!
//! ## 意图（Why）
//! - 轮询（poll）需要在“推送式”的接收流上识别一段完整应答，但应答可能从任意
//!   字节偏移开始，且分散在多次接收回调中；
//! - [`StateMachineManager`] 为每个输入位置实例化一个新候选状态机，并把后续输入逐个
//!   喂给所有在途候选，从而在不假设边界的前提下找出全部完成的匹配。
//!
//! ## 契约（What）
//! - 一次性批量喂入与逐个喂入得到的结果序列完全一致；
//! - 返回顺序即完成顺序（随输入顺序推进），同一输入上同时完成的候选按起点先后排列；
//! - `apply` 返回 `false` 的候选直接丢弃，即使其 `is_finished()` 为真。

use std::marker::PhantomData;

use parking_lot::Mutex;

/// 单个候选匹配的状态机。
///
/// - `apply`：消费一个输入，返回是否继续消费；
/// - `is_finished`：是否已构成完整匹配。
pub trait StateMachine<T> {
    fn apply(&mut self, input: &T) -> bool;

    fn is_finished(&self) -> bool;
}

struct ManagerState<M, F> {
    factory: F,
    in_flight: Vec<M>,
}

/// 多起点状态机调度器。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// 对每个输入：
/// 1. 调用工厂；若得到新实例则加入在途集合；
/// 2. 将输入依次交给全部在途实例：`apply` 为假则丢弃，否则若已完成则收入结果并移出；
/// 3. 幸存者保留到下一个输入。
///
/// ## 契约 (What)
/// - 整个 `feed` 在一把互斥锁内完成，多线程并发 `feed` 会排队而非交错；
/// - 工厂返回 `None` 时跳过新建步骤，但已有在途实例照常推进。
pub struct StateMachineManager<M, F, T> {
    state: Mutex<ManagerState<M, F>>,
    _input: PhantomData<fn(&T)>,
}

impl<M, F, T> StateMachineManager<M, F, T>
where
    M: StateMachine<T>,
    F: FnMut() -> Option<M>,
{
    pub fn new(factory: F) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                factory,
                in_flight: Vec::new(),
            }),
            _input: PhantomData,
        }
    }

    /// 喂入一批输入，返回本次调用中完成的全部匹配。
    pub fn feed<I>(&self, inputs: I) -> Vec<M>
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.state.lock();
        let ManagerState { factory, in_flight } = &mut *state;
        let mut completed = Vec::new();
        for input in inputs {
            if let Some(candidate) = factory() {
                in_flight.push(candidate);
            }
            let candidates = std::mem::take(in_flight);
            for mut candidate in candidates {
                if !candidate.apply(&input) {
                    continue;
                }
                if candidate.is_finished() {
                    completed.push(candidate);
                } else {
                    in_flight.push(candidate);
                }
            }
        }
        completed
    }

    /// 当前在途候选数量。
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
