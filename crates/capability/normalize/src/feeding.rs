//! 累计投料量与上料（补料）检测。
//!
//! 投料量在每个重算节拍累加：非上料期间取最近一个节拍内超过死区的逐点下降之和，
//! 并缓存该值；上料期间重量被补料抬高，改用缓存值补偿。累计值只增不减。
//!
//! 上料检测逐样本驱动：连续 [`LOADING_DEBOUNCE`] 次上升进入上料，
//! 上料中连续同样次数下降则结束并产出 [`LoadingRecord`]。

use crate::feed_rate::{FeedRateConfig, FeedRateWindow};

/// 小于该幅度的重量变化视为噪声（kg）。
pub const DEAD_ZONE_KG: f64 = 0.01;
/// 上料开始/结束的连续确认次数。
pub const LOADING_DEBOUNCE: u32 = 3;

/// 一次完整的上料过程。
#[derive(Debug, Clone, PartialEq)]
pub struct LoadingRecord {
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl LoadingRecord {
    /// 上料量：过程中最高与最低重量之差。
    pub fn amount(&self) -> f64 {
        self.max_weight - self.min_weight
    }
}

/// 上料状态迁移。
#[derive(Debug, Clone, PartialEq)]
pub enum LoadingEvent {
    Started { ts_ms: i64, weight: f64 },
    Finished(LoadingRecord),
}

#[derive(Debug, Clone, Copy)]
struct ActiveLoading {
    start_ts_ms: i64,
    min_weight: f64,
    max_weight: f64,
}

#[derive(Debug, Clone, Default)]
struct LoadingDetector {
    rise: u32,
    fall: u32,
    active: Option<ActiveLoading>,
}

impl LoadingDetector {
    fn observe(&mut self, prev: (f64, i64), curr: (f64, i64)) -> Option<LoadingEvent> {
        let (prev_weight, prev_ts) = prev;
        let (weight, ts_ms) = curr;
        let diff = weight - prev_weight;
        if diff > DEAD_ZONE_KG {
            self.rise += 1;
            self.fall = 0;
        } else if diff < -DEAD_ZONE_KG {
            self.fall += 1;
            self.rise = 0;
        }

        let mut event = None;
        if self.active.is_none() && self.rise >= LOADING_DEBOUNCE {
            self.active = Some(ActiveLoading {
                start_ts_ms: prev_ts,
                min_weight: prev_weight,
                max_weight: weight,
            });
            self.rise = 0;
            event = Some(LoadingEvent::Started {
                ts_ms: prev_ts,
                weight: prev_weight,
            });
        }

        let active = self.active.as_mut()?;
        active.max_weight = active.max_weight.max(weight);
        active.min_weight = active.min_weight.min(weight);

        if self.fall >= LOADING_DEBOUNCE {
            let record = LoadingRecord {
                start_ts_ms: active.start_ts_ms,
                end_ts_ms: ts_ms,
                min_weight: active.min_weight,
                max_weight: active.max_weight,
            };
            *self = Self::default();
            return Some(LoadingEvent::Finished(record));
        }
        event
    }
}

/// 单次推入后的称重派生量。
#[derive(Debug, Clone, PartialEq)]
pub struct FeedingUpdate {
    /// 下料速率（kg/s）。
    pub feed_rate: f64,
    /// 累计投料量（kg）。
    pub feeding_total: f64,
    pub loading: bool,
    pub event: Option<LoadingEvent>,
}

/// 单个料斗的速率窗口 + 投料累计 + 上料检测。
#[derive(Debug, Clone)]
pub struct FeedingTracker {
    window: FeedRateWindow,
    detector: LoadingDetector,
    cached_drop: f64,
    total: f64,
}

impl FeedingTracker {
    pub fn new(config: FeedRateConfig) -> Self {
        Self {
            window: FeedRateWindow::new(config),
            detector: LoadingDetector::default(),
            cached_drop: 0.0,
            total: 0.0,
        }
    }

    pub fn push(&mut self, weight: f64, ts_ms: i64) -> FeedingUpdate {
        let event = self
            .window
            .newest()
            .and_then(|prev| self.detector.observe(prev, (weight, ts_ms)));

        if self.window.push_tick(weight, ts_ms) {
            let steps = self.window.recompute_interval();
            let increment = if self.is_loading() {
                self.cached_drop
            } else {
                let drop = self.window.recent_drop(steps, DEAD_ZONE_KG);
                self.cached_drop = round2(drop);
                drop
            };
            if increment > 0.0 {
                self.total = round2(self.total + increment);
            }
        }

        FeedingUpdate {
            feed_rate: self.window.rate(),
            feeding_total: self.total,
            loading: self.is_loading(),
            event,
        }
    }

    /// 不推入新样本时的当前值（例如本次重量非有限数）。
    pub fn current(&self) -> FeedingUpdate {
        FeedingUpdate {
            feed_rate: self.window.rate(),
            feeding_total: self.total,
            loading: self.is_loading(),
            event: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.detector.active.is_some()
    }

    pub fn feeding_total(&self) -> f64 {
        self.total
    }

    pub fn window(&self) -> &FeedRateWindow {
        &self.window
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
