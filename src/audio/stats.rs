//! 播放统计
//!
//! - Position：精确的播放位置（帧 / 采样率），不经过浮点，长时间播放不漂移
//! - StreamStats：drop 计数（读后清零）和 buffer 流转计数
//! - StatsReport：某一时刻的快照，用于日志和命令行显示

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use super::format::AudioFormat;
use crate::engine::PlaybackState;

/// 播放位置
///
/// 有理数 `frames / sample_rate` 秒，相等和大小都按时长比较
#[derive(Clone, Copy, Debug)]
pub struct Position {
    frames: u64,
    sample_rate: u32,
}

impl Position {
    pub fn new(frames: u64, sample_rate: u32) -> Self {
        Self {
            frames,
            sample_rate,
        }
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_zero(&self) -> bool {
        self.frames == 0
    }

    pub fn as_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let rate = self.sample_rate as u64;
        let nanos = (self.frames % rate) * 1_000_000_000 / rate;
        Duration::new(self.frames / rate, nanos as u32)
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Position {
    /// 交叉相乘比较，不同采样率之间也精确
    ///
    /// 采样率为 0 的位置只和完全相同的位置相等
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.sample_rate == 0 || other.sample_rate == 0 {
            let same = self.frames == other.frames && self.sample_rate == other.sample_rate;
            return same.then_some(Ordering::Equal);
        }
        let lhs = self.frames as u128 * other.sample_rate as u128;
        let rhs = other.frames as u128 * self.sample_rate as u128;
        Some(lhs.cmp(&rhs))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.as_duration();
        let secs = d.as_secs();
        write!(
            f,
            "{}:{:02}.{:03}",
            secs / 60,
            secs % 60,
            d.subsec_millis()
        )
    }
}

/// Stream 计数器
///
/// 只在 Stream 的锁内修改
#[derive(Debug, Default)]
pub struct StreamStats {
    /// 自上次 `take_drops` 以来的 drop 数
    drops: u64,
    total_drops: u64,
    buffers_submitted: u64,
    buffers_retired: u64,
    frames_submitted: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次 drop
    #[inline]
    pub fn record_drop(&mut self) {
        self.drops += 1;
        self.total_drops += 1;
    }

    /// 读取并清零
    #[inline]
    pub fn take_drops(&mut self) -> u64 {
        std::mem::take(&mut self.drops)
    }

    #[inline]
    pub fn record_submit(&mut self, frames: usize) {
        self.buffers_submitted += 1;
        self.frames_submitted += frames as u64;
    }

    #[inline]
    pub fn record_retired(&mut self, buffers: usize) {
        self.buffers_retired += buffers as u64;
    }

    pub fn pending_drops(&self) -> u64 {
        self.drops
    }

    pub fn total_drops(&self) -> u64 {
        self.total_drops
    }

    pub fn buffers_submitted(&self) -> u64 {
        self.buffers_submitted
    }

    pub fn buffers_retired(&self) -> u64 {
        self.buffers_retired
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub state: PlaybackState,
    pub format: AudioFormat,
    pub buffer_frames: usize,
    pub buffer_count: usize,
    pub free_buffers: usize,
    pub queued_buffers: usize,
    pub pending_frames: usize,
    pub buffers_submitted: u64,
    pub buffers_retired: u64,
    pub frames_submitted: u64,
    pub pending_drops: u64,
    pub total_drops: u64,
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stream Statistics")?;
        writeln!(f, "=================")?;
        writeln!(f, "State: {:?}", self.state)?;
        writeln!(f, "Format: {}", self.format)?;
        writeln!(
            f,
            "Buffers: {} x {} frames ({} free, {} queued)",
            self.buffer_count, self.buffer_frames, self.free_buffers, self.queued_buffers
        )?;
        writeln!(f, "Pending: {} frames", self.pending_frames)?;
        writeln!(f)?;

        writeln!(f, "Buffers submitted: {}", self.buffers_submitted)?;
        writeln!(f, "Buffers retired: {}", self.buffers_retired)?;
        writeln!(
            f,
            "Frames submitted: {} ({})",
            self.frames_submitted,
            Position::new(self.frames_submitted, self.format.sample_rate)
        )?;
        writeln!(
            f,
            "Drops: {} (unread: {})",
            self.total_drops, self.pending_drops
        )?;

        Ok(())
    }
}
