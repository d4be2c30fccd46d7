//! 下料速率：基于尾随窗口的失重速率估计。

use std::collections::VecDeque;

/// 窗口参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRateConfig {
    /// 窗口容量（样本数）。
    pub window_size: usize,
    /// 每累计多少个新样本重算一次（窗口内至少 2 个样本才出值）。
    pub recompute_interval: usize,
}

impl Default for FeedRateConfig {
    fn default() -> Self {
        Self {
            window_size: 36,
            recompute_interval: 12,
        }
    }
}

impl FeedRateConfig {
    fn sanitized(mut self) -> Self {
        if self.window_size < 2 {
            self.window_size = 2;
        }
        if self.recompute_interval == 0 {
            self.recompute_interval = 1;
        }
        self
    }
}

/// 有界的 (重量, 时间戳) 有序窗口。
#[derive(Debug, Clone)]
pub struct FeedRateWindow {
    samples: VecDeque<(f64, i64)>,
    capacity: usize,
    recompute_interval: usize,
    since_recompute: usize,
    rate: f64,
}

impl FeedRateWindow {
    pub fn new(config: FeedRateConfig) -> Self {
        let config = config.sanitized();
        Self {
            samples: VecDeque::with_capacity(config.window_size),
            capacity: config.window_size,
            recompute_interval: config.recompute_interval,
            since_recompute: 0,
            rate: 0.0,
        }
    }

    /// 追加一个观测值并返回当前速率（kg/s）。
    ///
    /// 窗口内不足 2 个样本时速率为 0；重量上升（补料）时钳制为 0。
    pub fn push(&mut self, weight: f64, ts_ms: i64) -> f64 {
        self.push_tick(weight, ts_ms);
        self.rate
    }

    /// 追加观测值；本次到达重算节拍且窗口可出值时返回 true。
    pub(crate) fn push_tick(&mut self, weight: f64, ts_ms: i64) -> bool {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((weight, ts_ms));
        self.since_recompute = self.since_recompute.saturating_add(1);

        if self.since_recompute < self.recompute_interval {
            return false;
        }
        self.since_recompute = 0;
        if self.samples.len() < 2 {
            self.rate = 0.0;
            return false;
        }
        self.rate = self.compute();
        true
    }

    /// 最近 `steps` 步内超过死区的逐点下降量之和。
    pub(crate) fn recent_drop(&self, steps: usize, dead_zone: f64) -> f64 {
        let take = steps.saturating_add(1).min(self.samples.len());
        if take < 2 {
            return 0.0;
        }
        let start = self.samples.len() - take;
        self.samples
            .range(start..)
            .zip(self.samples.range(start + 1..))
            .map(|(&(prev, _), &(curr, _))| prev - curr)
            .filter(|drop| drop.is_finite() && *drop > dead_zone)
            .sum()
    }

    pub(crate) fn recompute_interval(&self) -> usize {
        self.recompute_interval
    }

    pub(crate) fn newest(&self) -> Option<(f64, i64)> {
        self.samples.back().copied()
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    fn compute(&self) -> f64 {
        let (Some(&(oldest_weight, oldest_ts)), Some(&(newest_weight, newest_ts))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed_secs = (newest_ts - oldest_ts) as f64 / 1000.0;
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        let rate = (oldest_weight - newest_weight) / elapsed_secs;
        if rate.is_finite() { rate.max(0.0) } else { 0.0 }
    }
}
