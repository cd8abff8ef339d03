//! 进程内模拟后端
//!
//! 按 OpenAL 流式 source 的语义建模：
//! - 已播放完的 buffer 留在队列里，直到被 dequeue
//! - sample offset 从队首（包括已播放的 buffer）算起
//! - 队列播空后 source 自动进入 Stopped
//! - Stopped 的 source 上所有排队的 buffer（包括之后新排队的）都算 processed
//! - 对 Stopped 的 source 调用 play 会从队首重新开始
//!
//! 两种时钟：
//! - 手动：测试里通过 [`SimulatedHandle::advance`] 推进
//! - 墙钟：演示程序使用，每次调用时按流逝的真实时间推进

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{Backend, BackendError, BufferId, ErrorCode, Op, SourceId, SourceState};
use crate::audio::format::BufferFormat;

/// 模拟 buffer
#[derive(Default)]
struct SimBuffer {
    format: Option<BufferFormat>,
    sample_rate: u32,
    frames: usize,
    data: Vec<u8>,
}

/// 模拟 source
struct SimSource {
    state: SourceState,
    queue: VecDeque<BufferId>,
    /// 队首已播放完的 buffer 数
    processed: usize,
    /// 当前 buffer 内的帧偏移
    cursor: usize,
}

impl SimSource {
    fn new() -> Self {
        Self {
            state: SourceState::Initial,
            queue: VecDeque::new(),
            processed: 0,
            cursor: 0,
        }
    }

    /// 可以 dequeue 的 buffer 数
    fn processed_count(&self) -> usize {
        if self.state == SourceState::Stopped {
            self.queue.len()
        } else {
            self.processed
        }
    }
}

enum Clock {
    Manual,
    Wall { last: Instant },
}

/// 共享的模拟设备状态
struct Device {
    next_id: u32,
    buffers: HashMap<BufferId, SimBuffer>,
    sources: HashMap<SourceId, SimSource>,
    clock: Clock,
    /// 待注入的失败（按顺序匹配）
    failures: Vec<(Op, ErrorCode)>,
    /// 在某个调用执行前推进时钟（只用于手动时钟）
    scheduled: Vec<(Op, usize)>,
    /// 调用记录（只在手动时钟下记录）
    calls: Vec<Op>,
}

impl Device {
    fn new(clock: Clock) -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            sources: HashMap::new(),
            clock,
            failures: Vec::new(),
            scheduled: Vec::new(),
            calls: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// 记录调用并检查是否有注入的失败
    fn enter(&mut self, op: Op) -> Result<(), BackendError> {
        if matches!(self.clock, Clock::Manual) {
            self.calls.push(op);
        }
        if let Some(idx) = self.failures.iter().position(|(o, _)| *o == op) {
            let (_, code) = self.failures.remove(idx);
            log::debug!("Simulated failure injected: {} -> {}", op, code);
            return Err(BackendError::Call { op, code });
        }
        if let Some(idx) = self.scheduled.iter().position(|(o, _)| *o == op) {
            let (_, frames) = self.scheduled.remove(idx);
            self.advance(frames);
        }
        self.tick();
        Ok(())
    }

    fn source_mut(&mut self, op: Op, id: SourceId) -> Result<&mut SimSource, BackendError> {
        self.sources.get_mut(&id).ok_or(BackendError::Call {
            op,
            code: ErrorCode::InvalidName,
        })
    }

    /// 墙钟模式：按真实流逝时间推进
    fn tick(&mut self) {
        let Clock::Wall { last } = self.clock else {
            return;
        };

        let rate = self
            .sources
            .values()
            .filter(|s| s.state == SourceState::Playing)
            .find_map(|s| s.queue.get(s.processed))
            .and_then(|id| self.buffers.get(id))
            .map(|b| b.sample_rate)
            .filter(|&r| r > 0);

        let now = Instant::now();
        let Some(rate) = rate else {
            self.clock = Clock::Wall { last: now };
            return;
        };

        let elapsed = now.duration_since(last);
        let frames = (elapsed.as_nanos() * rate as u128 / 1_000_000_000) as usize;
        if frames == 0 {
            return;
        }

        // 只把消耗掉的帧对应的时间计入，避免累计误差
        let consumed = Duration::from_nanos((frames as u128 * 1_000_000_000 / rate as u128) as u64);
        self.clock = Clock::Wall {
            last: last + consumed,
        };
        self.advance(frames);
    }

    /// 推进所有正在播放的 source
    fn advance(&mut self, frames: usize) {
        let buffers = &self.buffers;
        for source in self.sources.values_mut() {
            let mut remaining = frames;
            while source.state == SourceState::Playing {
                let Some(id) = source.queue.get(source.processed) else {
                    // 队列播空
                    source.state = SourceState::Stopped;
                    source.cursor = 0;
                    break;
                };
                let len = buffers.get(id).map(|b| b.frames).unwrap_or(0);
                let left = len.saturating_sub(source.cursor);
                if remaining < left {
                    source.cursor += remaining;
                    break;
                }
                remaining -= left;
                source.processed += 1;
                source.cursor = 0;
            }
        }
    }

    fn queued_buffer(&self, id: BufferId) -> bool {
        self.sources.values().any(|s| s.queue.contains(&id))
    }
}

/// 模拟后端
pub struct SimulatedBackend {
    device: Arc<Mutex<Device>>,
}

/// 测试用句柄：与后端共享同一个模拟设备
#[derive(Clone)]
pub struct SimulatedHandle {
    device: Arc<Mutex<Device>>,
}

fn lock(device: &Mutex<Device>) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedBackend {
    /// 手动时钟（测试用）
    pub fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(Device::new(Clock::Manual))),
        }
    }

    /// 墙钟（演示用）
    pub fn realtime() -> Self {
        Self {
            device: Arc::new(Mutex::new(Device::new(Clock::Wall {
                last: Instant::now(),
            }))),
        }
    }

    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle {
            device: Arc::clone(&self.device),
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHandle {
    /// 让所有播放中的 source 前进 `frames` 帧
    pub fn advance(&self, frames: usize) {
        lock(&self.device).advance(frames);
    }

    /// 下一次 `op` 调用返回 `code`
    pub fn fail_next(&self, op: Op, code: ErrorCode) {
        lock(&self.device).failures.push((op, code));
    }

    /// 下一次 `op` 调用执行前先推进 `frames` 帧
    pub fn advance_on(&self, op: Op, frames: usize) {
        lock(&self.device).scheduled.push((op, frames));
    }

    /// 取出并清空调用记录（墙钟模式下不记录）
    pub fn take_calls(&self) -> Vec<Op> {
        std::mem::take(&mut lock(&self.device).calls)
    }

    pub fn source_state(&self, source: SourceId) -> Option<SourceState> {
        lock(&self.device).sources.get(&source).map(|s| s.state)
    }

    /// 当前唯一的 source（测试通常只创建一个）
    pub fn only_source(&self) -> Option<SourceId> {
        let device = lock(&self.device);
        let mut ids = device.sources.keys();
        match (ids.next(), ids.next()) {
            (Some(id), None) => Some(*id),
            _ => None,
        }
    }

    /// source 上排队的 buffer（队首在前）
    pub fn queue(&self, source: SourceId) -> Vec<BufferId> {
        lock(&self.device)
            .sources
            .get(&source)
            .map(|s| s.queue.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn buffer_data(&self, buffer: BufferId) -> Option<Vec<u8>> {
        lock(&self.device).buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn live_buffers(&self) -> usize {
        lock(&self.device).buffers.len()
    }

    pub fn live_sources(&self) -> usize {
        lock(&self.device).sources.len()
    }
}

impl Backend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn create_source(&mut self) -> Result<SourceId, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::CreateSource)?;
        let id = SourceId(device.next_id());
        device.sources.insert(id, SimSource::new());
        Ok(id)
    }

    fn create_buffers(&mut self, count: usize) -> Result<Vec<BufferId>, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::CreateBuffers)?;
        let ids: Vec<BufferId> = (0..count).map(|_| BufferId(device.next_id())).collect();
        for id in &ids {
            device.buffers.insert(*id, SimBuffer::default());
        }
        Ok(ids)
    }

    fn submit(
        &mut self,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::Submit)?;

        let op_err = |code| BackendError::Call {
            op: Op::Submit,
            code,
        };
        if device.queued_buffer(buffer) {
            return Err(op_err(ErrorCode::InvalidOperation));
        }
        let bytes_per_frame =
            format.sample_type().bytes_per_sample() * format.channels() as usize;
        if sample_rate == 0 || data.len() % bytes_per_frame != 0 {
            return Err(op_err(ErrorCode::InvalidValue));
        }

        let slot = device
            .buffers
            .get_mut(&buffer)
            .ok_or(op_err(ErrorCode::InvalidName))?;
        slot.format = Some(format);
        slot.sample_rate = sample_rate;
        slot.frames = data.len() / bytes_per_frame;
        slot.data = data.to_vec();
        Ok(())
    }

    fn enqueue(&mut self, source: SourceId, buffer: BufferId) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::Enqueue)?;

        let op_err = |code| BackendError::Call {
            op: Op::Enqueue,
            code,
        };
        let format = device
            .buffers
            .get(&buffer)
            .ok_or(op_err(ErrorCode::InvalidName))?
            .format;
        if device.queued_buffer(buffer) {
            return Err(op_err(ErrorCode::InvalidOperation));
        }

        // 同一队列里的 buffer 必须格式一致
        let queue_format = device
            .sources
            .get(&source)
            .and_then(|s| s.queue.front())
            .and_then(|id| device.buffers.get(id))
            .and_then(|b| b.format);
        if queue_format.is_some() && queue_format != format {
            return Err(op_err(ErrorCode::InvalidOperation));
        }

        device.source_mut(Op::Enqueue, source)?.queue.push_back(buffer);
        Ok(())
    }

    fn dequeue_processed(
        &mut self,
        source: SourceId,
        max: usize,
    ) -> Result<Vec<BufferId>, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::DequeueProcessed)?;

        let src = device.source_mut(Op::DequeueProcessed, source)?;
        if max > src.processed_count() {
            return Err(BackendError::Call {
                op: Op::DequeueProcessed,
                code: ErrorCode::InvalidValue,
            });
        }
        let taken: Vec<BufferId> = src.queue.drain(..max).collect();
        src.processed = src.processed.saturating_sub(max);
        Ok(taken)
    }

    fn play(&mut self, source: SourceId) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::Play)?;

        let src = device.source_mut(Op::Play, source)?;
        match src.state {
            SourceState::Paused => src.state = SourceState::Playing,
            SourceState::Playing => {
                // 重新开始当前 buffer
                src.cursor = 0;
            }
            SourceState::Initial | SourceState::Stopped => {
                src.processed = 0;
                src.cursor = 0;
                src.state = if src.queue.is_empty() {
                    SourceState::Stopped
                } else {
                    SourceState::Playing
                };
            }
        }
        Ok(())
    }

    fn pause(&mut self, source: SourceId) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::Pause)?;

        let src = device.source_mut(Op::Pause, source)?;
        if src.state == SourceState::Playing {
            src.state = SourceState::Paused;
        }
        Ok(())
    }

    fn stop(&mut self, source: SourceId) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::Stop)?;

        let src = device.source_mut(Op::Stop, source)?;
        if src.state != SourceState::Initial {
            src.state = SourceState::Stopped;
        }
        src.processed = src.queue.len();
        src.cursor = 0;
        Ok(())
    }

    fn detach_all(&mut self, source: SourceId) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::DetachAll)?;

        let src = device.source_mut(Op::DetachAll, source)?;
        if matches!(src.state, SourceState::Playing | SourceState::Paused) {
            return Err(BackendError::Call {
                op: Op::DetachAll,
                code: ErrorCode::InvalidOperation,
            });
        }
        src.queue.clear();
        src.processed = 0;
        src.cursor = 0;
        Ok(())
    }

    fn query_state(&mut self, source: SourceId) -> Result<SourceState, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::QueryState)?;
        Ok(device.source_mut(Op::QueryState, source)?.state)
    }

    fn query_sample_offset(&mut self, source: SourceId) -> Result<usize, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::QuerySampleOffset)?;

        let src = device
            .sources
            .get(&source)
            .ok_or(BackendError::Call {
                op: Op::QuerySampleOffset,
                code: ErrorCode::InvalidName,
            })?;
        if !matches!(src.state, SourceState::Playing | SourceState::Paused) {
            return Ok(0);
        }
        let played: usize = src
            .queue
            .iter()
            .take(src.processed)
            .filter_map(|id| device.buffers.get(id))
            .map(|b| b.frames)
            .sum();
        Ok(played + src.cursor)
    }

    fn query_buffers_queued(&mut self, source: SourceId) -> Result<usize, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::QueryBuffersQueued)?;
        Ok(device.source_mut(Op::QueryBuffersQueued, source)?.queue.len())
    }

    fn query_buffers_processed(&mut self, source: SourceId) -> Result<usize, BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::QueryBuffersProcessed)?;
        Ok(device
            .source_mut(Op::QueryBuffersProcessed, source)?
            .processed_count())
    }

    fn delete_buffers(&mut self, buffers: &[BufferId]) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::DeleteBuffers)?;

        if buffers.iter().any(|id| device.queued_buffer(*id)) {
            return Err(BackendError::Call {
                op: Op::DeleteBuffers,
                code: ErrorCode::InvalidOperation,
            });
        }
        for id in buffers {
            device.buffers.remove(id);
        }
        Ok(())
    }

    fn delete_source(&mut self, source: SourceId) -> Result<(), BackendError> {
        let mut device = lock(&self.device);
        device.enter(Op::DeleteSource)?;

        device.sources.remove(&source).ok_or(BackendError::Call {
            op: Op::DeleteSource,
            code: ErrorCode::InvalidName,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(buffers: usize) -> (SimulatedBackend, SimulatedHandle, SourceId, Vec<BufferId>) {
        let mut backend = SimulatedBackend::new();
        let handle = backend.handle();
        let source = backend.create_source().unwrap();
        let ids = backend.create_buffers(buffers).unwrap();
        (backend, handle, source, ids)
    }

    fn fill(backend: &mut SimulatedBackend, buffer: BufferId, frames: usize) {
        let data = vec![0u8; frames * 4];
        backend
            .submit(buffer, BufferFormat::Stereo16, &data, 44100)
            .unwrap();
    }

    #[test]
    fn test_playback_progress_and_processed() {
        let (mut backend, handle, source, ids) = setup(2);
        for id in &ids {
            fill(&mut backend, *id, 10);
            backend.enqueue(source, *id).unwrap();
        }
        backend.play(source).unwrap();

        handle.advance(4);
        assert_eq!(backend.query_sample_offset(source).unwrap(), 4);
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 0);

        handle.advance(10);
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 1);
        // offset 从队首算起，包括已播放但未取回的 buffer
        assert_eq!(backend.query_sample_offset(source).unwrap(), 14);

        let taken = backend.dequeue_processed(source, 1).unwrap();
        assert_eq!(taken, vec![ids[0]]);
        assert_eq!(backend.query_buffers_queued(source).unwrap(), 1);
        assert_eq!(backend.query_sample_offset(source).unwrap(), 4);
    }

    #[test]
    fn test_source_stops_when_queue_runs_dry() {
        let (mut backend, handle, source, ids) = setup(1);
        fill(&mut backend, ids[0], 8);
        backend.enqueue(source, ids[0]).unwrap();
        backend.play(source).unwrap();

        handle.advance(20);
        assert_eq!(backend.query_state(source).unwrap(), SourceState::Stopped);
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 1);
        assert_eq!(backend.query_sample_offset(source).unwrap(), 0);
    }

    #[test]
    fn test_play_with_empty_queue_stops() {
        let (mut backend, _handle, source, _ids) = setup(1);
        backend.play(source).unwrap();
        assert_eq!(backend.query_state(source).unwrap(), SourceState::Stopped);
    }

    #[test]
    fn test_cannot_refill_queued_buffer() {
        let (mut backend, _handle, source, ids) = setup(1);
        fill(&mut backend, ids[0], 4);
        backend.enqueue(source, ids[0]).unwrap();

        let err = backend
            .submit(ids[0], BufferFormat::Stereo16, &[0; 16], 44100)
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Call {
                op: Op::Submit,
                code: ErrorCode::InvalidOperation
            }
        );
    }

    #[test]
    fn test_detach_requires_stopped_source() {
        let (mut backend, _handle, source, ids) = setup(1);
        fill(&mut backend, ids[0], 4);
        backend.enqueue(source, ids[0]).unwrap();
        backend.play(source).unwrap();

        assert!(backend.detach_all(source).is_err());
        backend.stop(source).unwrap();
        backend.detach_all(source).unwrap();
        assert_eq!(backend.query_buffers_queued(source).unwrap(), 0);
    }

    #[test]
    fn test_dequeue_more_than_processed_fails() {
        let (mut backend, _handle, source, ids) = setup(1);
        fill(&mut backend, ids[0], 4);
        backend.enqueue(source, ids[0]).unwrap();
        assert!(backend.dequeue_processed(source, 1).is_err());
    }

    #[test]
    fn test_fail_next_is_consumed_once() {
        let (mut backend, handle, source, _ids) = setup(1);
        handle.fail_next(Op::Play, ErrorCode::OutOfMemory);

        assert!(backend.play(source).is_err());
        assert!(backend.play(source).is_ok());
        assert_eq!(handle.take_calls(), vec![Op::Play, Op::Play]);
    }

    #[test]
    fn test_enqueue_on_stopped_source_is_processed() {
        let (mut backend, handle, source, ids) = setup(2);
        fill(&mut backend, ids[0], 4);
        backend.enqueue(source, ids[0]).unwrap();
        backend.play(source).unwrap();
        handle.advance(10);
        assert_eq!(backend.query_state(source).unwrap(), SourceState::Stopped);

        // 播空后新排队的 buffer 还没播放，但同样报告为 processed
        fill(&mut backend, ids[1], 4);
        backend.enqueue(source, ids[1]).unwrap();
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 2);

        // 只取回旧的那个，再 play 就从新 buffer 开始
        assert_eq!(backend.dequeue_processed(source, 1).unwrap(), vec![ids[0]]);
        backend.play(source).unwrap();
        assert_eq!(backend.query_state(source).unwrap(), SourceState::Playing);
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 0);
        handle.advance(2);
        assert_eq!(backend.query_sample_offset(source).unwrap(), 2);
    }

    #[test]
    fn test_initial_source_has_nothing_processed() {
        let (mut backend, _handle, source, ids) = setup(1);
        fill(&mut backend, ids[0], 4);
        backend.enqueue(source, ids[0]).unwrap();
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 0);
    }

    #[test]
    fn test_advance_on_runs_before_call() {
        let (mut backend, handle, source, ids) = setup(2);
        fill(&mut backend, ids[0], 4);
        backend.enqueue(source, ids[0]).unwrap();
        backend.play(source).unwrap();

        handle.advance_on(Op::Enqueue, 4);
        fill(&mut backend, ids[1], 4);
        backend.enqueue(source, ids[1]).unwrap();
        assert_eq!(backend.query_state(source).unwrap(), SourceState::Stopped);
        assert_eq!(backend.query_buffers_processed(source).unwrap(), 2);
    }

    #[test]
    fn test_realtime_clock_keeps_no_call_log() {
        let mut backend = SimulatedBackend::realtime();
        let handle = backend.handle();
        let source = backend.create_source().unwrap();
        for _ in 0..1000 {
            backend.query_state(source).unwrap();
        }
        assert!(handle.take_calls().is_empty());
    }

    #[test]
    fn test_realtime_clock_advances() {
        let mut backend = SimulatedBackend::realtime();
        let source = backend.create_source().unwrap();
        let ids = backend.create_buffers(1).unwrap();
        // 1 秒 @ 1000Hz
        backend
            .submit(ids[0], BufferFormat::Mono8, &[128; 1000], 1000)
            .unwrap();
        backend.enqueue(source, ids[0]).unwrap();
        backend.play(source).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let offset = backend.query_sample_offset(source).unwrap();
        assert!(offset >= 20, "expected playback to advance, got {}", offset);
    }
}
