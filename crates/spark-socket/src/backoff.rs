use std::time::Duration;

use crate::config::BackoffConfig;

/// 管理重连循环的退避节奏。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 建连失败后立即重试会在目标不可达时空转 CPU；此处把连续失败次数映射为
///   有上限的指数退避间隔，使重连循环在故障期间保持低负载。
///
/// ## 逻辑 (How)
/// - `failures` 记录连续失败次数；`next_delay` 每调用一次递增计数并返回
///   `initial * multiplier^(failures-1)`，结果被截断到 `max`；
/// - 每轮建连循环新建一个实例，因此下一次断线总是从 `initial` 重新开始。
///
/// ## 契约 (What)
/// - 返回值单调不减，且永不超过 `max`；
/// - **前置条件**：配置已通过 [`SocketConfig::validate`](crate::config::SocketConfig::validate)，
///   即 `initial <= max` 且 `multiplier >= 1`。
///
/// ## 注意事项 (Trade-offs)
/// - 未引入抖动（jitter）；大量客户端同时重连同一服务端时可能同步撞击。
#[derive(Debug, Clone)]
pub(crate) struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    failures: u32,
    current: Duration,
}

impl ReconnectBackoff {
    pub(crate) fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_ms);
        Self {
            initial,
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier.max(1),
            failures: 0,
            current: initial,
        }
    }

    /// 记录一次失败并返回本次应等待的时长。
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = if self.failures == 0 {
            self.initial
        } else {
            self.current
                .checked_mul(self.multiplier)
                .unwrap_or(self.max)
                .min(self.max)
        };
        self.failures = self.failures.saturating_add(1);
        self.current = delay.min(self.max);
        self.current
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(initial_ms: u64, max_ms: u64, multiplier: u32) -> ReconnectBackoff {
        ReconnectBackoff::new(&BackoffConfig {
            initial_ms,
            max_ms,
            multiplier,
        })
    }

    #[test]
    fn grows_exponentially_up_to_cap() {
        let mut b = backoff(10, 70, 2);
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 70, 70]);
        assert_eq!(b.failures(), 5);
    }

    #[test]
    fn multiplier_one_keeps_constant_delay() {
        let mut b = backoff(25, 1000, 1);
        for _ in 0..4 {
            assert_eq!(b.next_delay(), Duration::from_millis(25));
        }
    }
}
