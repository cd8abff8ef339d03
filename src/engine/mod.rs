//! 流式播放引擎
//!
//! 把调用方持续送入的交织样本切分成固定大小的 buffer，
//! 在一个很小的后端 buffer 池（默认 3 个）里循环使用，保持 source 不断流
//!
//! 数据流：
//! feed → 回收已播放完的 buffer → 追加到累积器 → 满一个 buffer 且有空闲 → 提交并排队
//!
//! 并发：所有公开操作都在同一把锁内完成，后端调用不阻塞；
//! feed 从不等待空闲 buffer，只是返回更少的已消费帧数

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::audio::backend::{Backend, BackendError, SourceId, SourceState};
use crate::audio::format::{AudioFormat, BufferFormat, FormatError, Sample};
use crate::audio::stats::{Position, StatsReport, StreamStats};

mod pool;

use pool::BufferPool;

/// 默认 buffer 数量
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// 后端队列播空（underrun）时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnderrunPolicy {
    /// 不检测：只有播放中改变格式才计为 drop
    #[default]
    Ignore,
    /// 计一次 drop，回收全部 buffer，有新数据排队后自动重新 play
    Restart,
}

/// Stream 配置
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// 初始格式
    pub format: AudioFormat,
    /// 后端 buffer 数量
    pub buffer_count: usize,
    /// 每个 buffer 的帧数（None = 1 秒音频）
    pub buffer_frames: Option<u32>,
    pub underrun_policy: UnderrunPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_frames: None,
            underrun_policy: UnderrunPolicy::Ignore,
        }
    }
}

impl StreamConfig {
    /// 指定格式下每个 buffer 的帧数
    pub fn buffer_frames_for(&self, format: &AudioFormat) -> usize {
        match self.buffer_frames {
            Some(frames) => frames as usize,
            None => format.sample_rate as usize,
        }
    }

    fn validate(&self) -> Result<BufferFormat, StreamError> {
        if self.buffer_count == 0 {
            return Err(StreamError::Config("buffer_count must be positive"));
        }
        if self.buffer_frames == Some(0) {
            return Err(StreamError::Config("buffer_frames must be positive"));
        }
        Ok(self.format.buffer_format()?)
    }
}

/// Stream 错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

/// 锁内状态
struct Inner<B: Backend> {
    backend: B,
    source: SourceId,
    format: AudioFormat,
    buffer_format: BufferFormat,
    /// 每个 buffer 的帧数
    capacity_frames: usize,
    pool: BufferPool,
    /// 尚未凑满一个 buffer 的样本（已编码的字节）
    pending: Vec<u8>,
    state: PlaybackState,
    /// 自上次 stop 以来播放完并取回的 buffer 数（用于计算位置）
    retired: u64,
    underrun_policy: UnderrunPolicy,
    /// 本次 underrun 已处理（已计数、已取回旧 buffer），等待重新 play
    restart_pending: bool,
    stats: StreamStats,
}

/// 流式播放引擎
///
/// 后端在构造时注入，Stream 销毁时回收全部 buffer 和 source
pub struct Stream<B: Backend> {
    config: StreamConfig,
    inner: Mutex<Inner<B>>,
}

impl<B: Backend> Stream<B> {
    /// 创建 source 和 buffer 池
    pub fn new(mut backend: B, config: StreamConfig) -> Result<Self, StreamError> {
        let buffer_format = config.validate()?;

        let source = backend.create_source()?;
        let buffers = match backend.create_buffers(config.buffer_count) {
            Ok(buffers) => buffers,
            Err(e) => {
                if let Err(err) = backend.delete_source(source) {
                    log::warn!("Failed to release source after init failure: {}", err);
                }
                return Err(e.into());
            }
        };

        let format = config.format;
        let capacity_frames = config.buffer_frames_for(&format);

        log::info!(
            "Stream opened on {} backend: {} buffers x {} frames, {}",
            backend.name(),
            buffers.len(),
            capacity_frames,
            format
        );

        let inner = Inner {
            backend,
            source,
            format,
            buffer_format,
            capacity_frames,
            pool: BufferPool::new(buffers),
            pending: Vec::with_capacity(capacity_frames * format.bytes_per_frame()),
            state: PlaybackState::Stopped,
            retired: 0,
            underrun_policy: config.underrun_policy,
            restart_pending: false,
            stats: StreamStats::new(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 开始 / 恢复播放
    ///
    /// 已在播放时为空操作；source 已饿死（后端不在播放）时重新下发 play。
    /// Restart 策略下先取回已播放的 buffer，避免从队首重播
    pub fn play(&self) -> Result<(), StreamError> {
        self.lock().play()
    }

    /// 暂停，已排队的 buffer 和位置保持不变
    pub fn pause(&self) -> Result<(), StreamError> {
        self.lock().pause()
    }

    /// 停止并清空全部排队数据，位置归零
    pub fn stop(&self) -> Result<(), StreamError> {
        self.lock().stop()
    }

    /// 送入交织样本，返回实际接受的帧数
    ///
    /// 只接受整帧；每次最多接受一个 buffer 减去已累积的部分。
    /// 没有空闲 buffer 时返回 0，调用方应稍后用剩余数据重试
    pub fn feed<S: Sample>(&self, samples: &[S], format: AudioFormat) -> Result<usize, StreamError> {
        if S::TYPE != format.sample_type {
            return Err(FormatError::SampleTypeMismatch {
                expected: format.sample_type,
                actual: S::TYPE,
            }
            .into());
        }
        let buffer_format = format.buffer_format()?;

        let mut inner = self.lock();
        inner.reclaim_processed()?;

        if format != inner.format {
            inner.change_format(format, buffer_format, &self.config)?;
        }

        inner.accept(samples)
    }

    /// 已播放时长
    pub fn position(&self) -> Result<Position, StreamError> {
        self.lock().position()
    }

    /// 已提交但尚未播放的帧数
    pub fn queue_size(&self) -> Result<usize, StreamError> {
        self.lock().queue_size()
    }

    /// 自上次调用以来的 drop 次数（读后清零）
    pub fn drops(&self) -> u64 {
        self.lock().stats.take_drops()
    }

    pub fn format(&self) -> AudioFormat {
        self.lock().format
    }

    /// 切换格式
    ///
    /// 播放中切换会强制 stop 并计一次 drop；
    /// 非播放状态下旧格式的排队数据同样作废
    pub fn set_format(&self, format: AudioFormat) -> Result<(), StreamError> {
        let buffer_format = format.buffer_format()?;
        let mut inner = self.lock();
        if format == inner.format {
            return Ok(());
        }
        inner.change_format(format, buffer_format, &self.config)
    }

    pub fn state(&self) -> PlaybackState {
        self.lock().state
    }

    /// 应该在播放但后端 source 已停下（队列播空）
    pub fn is_starved(&self) -> Result<bool, StreamError> {
        self.lock().is_starved()
    }

    /// 当前 buffer 的帧数
    pub fn buffer_frames(&self) -> usize {
        self.lock().capacity_frames
    }

    pub fn stats(&self) -> StatsReport {
        self.lock().report()
    }
}

impl<B: Backend> Inner<B> {
    fn bytes_per_buffer(&self) -> usize {
        self.capacity_frames * self.format.bytes_per_frame()
    }

    fn pending_frames(&self) -> usize {
        self.pending.len() / self.format.bytes_per_frame()
    }

    fn play(&mut self) -> Result<(), StreamError> {
        if self.state == PlaybackState::Playing {
            if self.backend.query_state(self.source)? == SourceState::Playing {
                return Ok(());
            }
            if self.underrun_policy == UnderrunPolicy::Restart {
                return self.reclaim_processed();
            }
        }

        self.backend.play(self.source)?;
        self.state = PlaybackState::Playing;
        self.restart_pending = false;
        log::debug!("Playing ({} buffers queued)", self.pool.queued_count());
        Ok(())
    }

    fn pause(&mut self) -> Result<(), StreamError> {
        if self.state != PlaybackState::Playing {
            return Ok(());
        }

        self.backend.pause(self.source)?;
        self.state = PlaybackState::Paused;
        log::debug!("Paused");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.backend.stop(self.source)?;
        self.backend.detach_all(self.source)?;

        self.pool.release_all();
        self.pending.clear();
        self.retired = 0;
        self.state = PlaybackState::Stopped;
        self.restart_pending = false;
        log::debug!("Stopped, all buffers released");
        Ok(())
    }

    /// 取回后端已播放完的 buffer
    ///
    /// 只在后端报告 Playing 时取回。Restart 策略下，饿死的 source
    /// 每次 underrun 只清空一次（此时队列里全是已播放的 buffer）
    fn reclaim_processed(&mut self) -> Result<(), StreamError> {
        let source_state = self.backend.query_state(self.source)?;
        if source_state == SourceState::Playing {
            let processed = self.backend.query_buffers_processed(self.source)?;
            return self.retire(processed);
        }

        let starved = self.state == PlaybackState::Playing;
        if !starved || self.underrun_policy != UnderrunPolicy::Restart {
            return Ok(());
        }

        if !self.restart_pending {
            self.drain_starved(0)?;
        }
        // 上次重新 play 失败时留下的 buffer
        if self.pool.queued_count() > 0 {
            self.backend.play(self.source)?;
            self.restart_pending = false;
            log::info!("Playback restarted after underrun");
        }
        Ok(())
    }

    /// 从队首取回 `count` 个 buffer 并计入已播放
    fn retire(&mut self, count: usize) -> Result<(), StreamError> {
        if count == 0 {
            return Ok(());
        }
        let buffers = self.backend.dequeue_processed(self.source, count)?;
        let reclaimed = self.pool.reclaim(&buffers);
        self.retired += reclaimed as u64;
        self.stats.record_retired(reclaimed);
        Ok(())
    }

    /// 处理一次 underrun：计一次 drop，取回除队尾 `keep` 个以外的 buffer
    ///
    /// 停止状态的 source 把队列里所有 buffer（包括刚排队、还没播放的）
    /// 都报告为 processed，所以新 buffer 必须用 `keep` 排除
    fn drain_starved(&mut self, keep: usize) -> Result<(), StreamError> {
        let processed = self.backend.query_buffers_processed(self.source)?;
        let played = processed
            .min(self.pool.queued_count())
            .saturating_sub(keep);
        self.retire(played)?;

        self.stats.record_drop();
        self.restart_pending = true;
        log::warn!("Source starved, {} played buffers reclaimed", played);
        Ok(())
    }

    /// 刚排队一个 buffer 后，Restart 策略下让饿死的 source 重新播放
    fn resume_after_enqueue(&mut self) -> Result<(), StreamError> {
        if self.backend.query_state(self.source)? == SourceState::Playing {
            return Ok(());
        }
        if !self.restart_pending {
            // reclaim 之后、enqueue 之前播空
            self.drain_starved(1)?;
        }
        self.backend.play(self.source)?;
        self.restart_pending = false;
        log::info!("Playback restarted after underrun");
        Ok(())
    }

    fn change_format(
        &mut self,
        format: AudioFormat,
        buffer_format: BufferFormat,
        config: &StreamConfig,
    ) -> Result<(), StreamError> {
        let was_playing = self.state == PlaybackState::Playing;

        // 旧格式的数据全部作废
        if was_playing || self.pool.queued_count() > 0 || !self.pending.is_empty() {
            self.stop()?;
        }

        if was_playing {
            self.stats.record_drop();
            log::warn!(
                "Format changed while playing ({} -> {}), queued audio dropped",
                self.format,
                format
            );
        } else {
            log::info!("Format changed: {} -> {}", self.format, format);
        }

        self.format = format;
        self.buffer_format = buffer_format;
        self.capacity_frames = config.buffer_frames_for(&format);
        Ok(())
    }

    /// 追加到累积器，满一个 buffer 时提交
    fn accept<S: Sample>(&mut self, samples: &[S]) -> Result<usize, StreamError> {
        // 没有空闲 buffer 时不接受任何数据
        if self.pool.free_count() == 0 {
            return Ok(0);
        }

        let channels = self.format.samples_per_frame();
        let capacity = self.capacity_frames * channels;
        let pending = self.pending_frames() * channels;
        let wanted = capacity.saturating_sub(pending) / channels * channels;
        let offered = samples.len() / channels * channels;
        let taken = wanted.min(offered);

        let rollback = self.pending.len();
        S::encode(&samples[..taken], &mut self.pending);

        if let Err(e) = self.submit_pending() {
            self.pending.truncate(rollback);
            return Err(e);
        }

        debug_assert!(self.pool.is_partitioned());
        Ok(taken / channels)
    }

    /// 累积器满且有空闲 buffer 时提交一个 buffer
    ///
    /// 只有 submit 和 enqueue 都成功后才修改 buffer 归属
    fn submit_pending(&mut self) -> Result<bool, StreamError> {
        let bytes = self.bytes_per_buffer();
        if self.pending.len() < bytes {
            return Ok(false);
        }
        let Some(buffer) = self.pool.peek_free() else {
            return Ok(false);
        };

        self.backend.submit(
            buffer,
            self.buffer_format,
            &self.pending[..bytes],
            self.format.sample_rate,
        )?;
        self.backend.enqueue(self.source, buffer)?;

        self.pool.mark_queued(buffer);
        self.pending.drain(..bytes);
        self.stats.record_submit(self.capacity_frames);

        // 数据已经交给后端，这里失败只记录，下次 feed 再重试 play
        if self.underrun_policy == UnderrunPolicy::Restart && self.state == PlaybackState::Playing {
            if let Err(e) = self.resume_after_enqueue() {
                log::warn!("Failed to restart playback after underrun: {}", e);
            }
        }

        log::trace!(
            "Queued buffer {:?} ({} frames), {} free",
            buffer,
            self.capacity_frames,
            self.pool.free_count()
        );
        Ok(true)
    }

    fn position(&mut self) -> Result<Position, StreamError> {
        let offset = self.backend.query_sample_offset(self.source)?;
        let frames = self.retired * self.capacity_frames as u64 + offset as u64;
        Ok(Position::new(frames, self.format.sample_rate))
    }

    fn queue_size(&mut self) -> Result<usize, StreamError> {
        let offset = self.backend.query_sample_offset(self.source)?;
        let queued = self.pool.queued_count() * self.capacity_frames;
        Ok(queued.saturating_sub(offset))
    }

    fn is_starved(&mut self) -> Result<bool, StreamError> {
        if self.state != PlaybackState::Playing {
            return Ok(false);
        }
        Ok(self.backend.query_state(self.source)? != SourceState::Playing)
    }

    fn report(&self) -> StatsReport {
        StatsReport {
            state: self.state,
            format: self.format,
            buffer_frames: self.capacity_frames,
            buffer_count: self.pool.size(),
            free_buffers: self.pool.free_count(),
            queued_buffers: self.pool.queued_count(),
            pending_frames: self.pending_frames(),
            buffers_submitted: self.stats.buffers_submitted(),
            buffers_retired: self.stats.buffers_retired(),
            frames_submitted: self.stats.frames_submitted(),
            pending_drops: self.stats.pending_drops(),
            total_drops: self.stats.total_drops(),
        }
    }

    /// 停止并销毁 buffer 和 source
    fn release(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop source during teardown: {}", e);
        }

        let buffers = self.pool.all();
        if let Err(e) = self.backend.delete_buffers(&buffers) {
            log::warn!("Failed to delete {} buffers: {}", buffers.len(), e);
        }
        if let Err(e) = self.backend.delete_source(self.source) {
            log::warn!("Failed to delete source: {}", e);
        }
        log::debug!("Stream released");
    }
}

impl<B: Backend> Drop for Stream<B> {
    fn drop(&mut self) {
        self.inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
    }
}
