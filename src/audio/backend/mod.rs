//! 后端适配层
//!
//! Stream 只通过这里定义的固定操作集合访问原生音频 API：
//!
//! ```text
//! ┌──────────────────────────────┐
//! │        Stream (engine)       │
//! │  buffer 池 / 累积器 / 计数    │
//! └──────────────┬───────────────┘
//!                │ trait Backend
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌──────────────┐ ┌──────────────┐
//! │  Simulated   │ │   OpenAL     │
//! │ (测试 / 演示) │ │ (feature)    │
//! └──────────────┘ └──────────────┘
//! ```
//!
//! 每个操作都是一次原子调用，失败通过 `Result` 显式返回

use std::fmt;

use thiserror::Error;

use super::format::BufferFormat;

#[cfg(feature = "openal")]
pub mod openal;
pub mod simulated;

#[cfg(feature = "openal")]
pub use openal::OpenAlBackend;
pub use simulated::{SimulatedBackend, SimulatedHandle};

/// 原生 source 句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SourceId(pub u32);

/// 原生 buffer 句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// 后端报告的 source 状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Initial,
    Playing,
    Paused,
    Stopped,
}

/// 后端操作
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    CreateSource,
    CreateBuffers,
    Submit,
    Enqueue,
    DequeueProcessed,
    Play,
    Pause,
    Stop,
    DetachAll,
    QueryState,
    QuerySampleOffset,
    QueryBuffersQueued,
    QueryBuffersProcessed,
    DeleteBuffers,
    DeleteSource,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateSource => "create_source",
            Self::CreateBuffers => "create_buffers",
            Self::Submit => "submit",
            Self::Enqueue => "enqueue",
            Self::DequeueProcessed => "dequeue_processed",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::DetachAll => "detach_all",
            Self::QueryState => "query_state",
            Self::QuerySampleOffset => "query_sample_offset",
            Self::QueryBuffersQueued => "query_buffers_queued",
            Self::QueryBuffersProcessed => "query_buffers_processed",
            Self::DeleteBuffers => "delete_buffers",
            Self::DeleteSource => "delete_source",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 原生错误码（数值与 AL_INVALID_* 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidName,
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
    Other(i32),
}

impl ErrorCode {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0xA001 => Self::InvalidName,
            0xA002 => Self::InvalidEnum,
            0xA003 => Self::InvalidValue,
            0xA004 => Self::InvalidOperation,
            0xA005 => Self::OutOfMemory,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid_name"),
            Self::InvalidEnum => write!(f, "invalid_enum"),
            Self::InvalidValue => write!(f, "invalid_value"),
            Self::InvalidOperation => write!(f, "invalid_operation"),
            Self::OutOfMemory => write!(f, "out_of_memory"),
            Self::Other(code) => write!(f, "error 0x{:04X}", code),
        }
    }
}

/// 后端错误
///
/// 后端出错后硬件状态未定义
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// 设备或上下文获取失败
    #[error("backend initialization failed: {0}")]
    Init(String),
    /// 某个原生调用返回错误码
    #[error("{op} failed with {code}")]
    Call { op: Op, code: ErrorCode },
}

/// 原生音频后端
///
/// 句柄（设备、上下文）归实现者所有，Drop 时释放
pub trait Backend: Send {
    /// 后端名称（日志用）
    fn name(&self) -> &'static str;

    fn create_source(&mut self) -> Result<SourceId, BackendError>;

    fn create_buffers(&mut self, count: usize) -> Result<Vec<BufferId>, BackendError>;

    /// 把交织样本写入 buffer（buffer 不能处于排队状态）
    fn submit(
        &mut self,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> Result<(), BackendError>;

    fn enqueue(&mut self, source: SourceId, buffer: BufferId) -> Result<(), BackendError>;

    /// 从队首取回最多 `max` 个已播放完的 buffer
    fn dequeue_processed(
        &mut self,
        source: SourceId,
        max: usize,
    ) -> Result<Vec<BufferId>, BackendError>;

    fn play(&mut self, source: SourceId) -> Result<(), BackendError>;

    fn pause(&mut self, source: SourceId) -> Result<(), BackendError>;

    fn stop(&mut self, source: SourceId) -> Result<(), BackendError>;

    /// 解除 source 上的全部 buffer（source 必须已停止）
    fn detach_all(&mut self, source: SourceId) -> Result<(), BackendError>;

    fn query_state(&mut self, source: SourceId) -> Result<SourceState, BackendError>;

    /// 从队首（包括已播放但未取回的 buffer）开始计算的帧偏移
    fn query_sample_offset(&mut self, source: SourceId) -> Result<usize, BackendError>;

    fn query_buffers_queued(&mut self, source: SourceId) -> Result<usize, BackendError>;

    fn query_buffers_processed(&mut self, source: SourceId) -> Result<usize, BackendError>;

    fn delete_buffers(&mut self, buffers: &[BufferId]) -> Result<(), BackendError>;

    fn delete_source(&mut self, source: SourceId) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create_source(&mut self) -> Result<SourceId, BackendError> {
        (**self).create_source()
    }

    fn create_buffers(&mut self, count: usize) -> Result<Vec<BufferId>, BackendError> {
        (**self).create_buffers(count)
    }

    fn submit(
        &mut self,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> Result<(), BackendError> {
        (**self).submit(buffer, format, data, sample_rate)
    }

    fn enqueue(&mut self, source: SourceId, buffer: BufferId) -> Result<(), BackendError> {
        (**self).enqueue(source, buffer)
    }

    fn dequeue_processed(
        &mut self,
        source: SourceId,
        max: usize,
    ) -> Result<Vec<BufferId>, BackendError> {
        (**self).dequeue_processed(source, max)
    }

    fn play(&mut self, source: SourceId) -> Result<(), BackendError> {
        (**self).play(source)
    }

    fn pause(&mut self, source: SourceId) -> Result<(), BackendError> {
        (**self).pause(source)
    }

    fn stop(&mut self, source: SourceId) -> Result<(), BackendError> {
        (**self).stop(source)
    }

    fn detach_all(&mut self, source: SourceId) -> Result<(), BackendError> {
        (**self).detach_all(source)
    }

    fn query_state(&mut self, source: SourceId) -> Result<SourceState, BackendError> {
        (**self).query_state(source)
    }

    fn query_sample_offset(&mut self, source: SourceId) -> Result<usize, BackendError> {
        (**self).query_sample_offset(source)
    }

    fn query_buffers_queued(&mut self, source: SourceId) -> Result<usize, BackendError> {
        (**self).query_buffers_queued(source)
    }

    fn query_buffers_processed(&mut self, source: SourceId) -> Result<usize, BackendError> {
        (**self).query_buffers_processed(source)
    }

    fn delete_buffers(&mut self, buffers: &[BufferId]) -> Result<(), BackendError> {
        (**self).delete_buffers(buffers)
    }

    fn delete_source(&mut self, source: SourceId) -> Result<(), BackendError> {
        (**self).delete_source(source)
    }
}

/// 可选的后端实现
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// 进程内模拟，按墙钟推进播放
    Simulated,
    /// 系统 OpenAL（需要 `openal` feature）
    OpenAl,
}

/// 按类型创建后端
pub fn create_backend(kind: BackendKind) -> Result<Box<dyn Backend>, BackendError> {
    match kind {
        BackendKind::Simulated => Ok(Box::new(SimulatedBackend::realtime())),
        #[cfg(feature = "openal")]
        BackendKind::OpenAl => Ok(Box::new(OpenAlBackend::open_default()?)),
        #[cfg(not(feature = "openal"))]
        BackendKind::OpenAl => Err(BackendError::Init(
            "built without the `openal` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from_raw(0xA003), ErrorCode::InvalidValue);
        assert_eq!(ErrorCode::from_raw(0xA004), ErrorCode::InvalidOperation);
        assert_eq!(ErrorCode::from_raw(42), ErrorCode::Other(42));
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Call {
            op: Op::Enqueue,
            code: ErrorCode::InvalidOperation,
        };
        assert_eq!(err.to_string(), "enqueue failed with invalid_operation");
    }

    #[test]
    fn test_create_simulated_backend() {
        let mut backend = create_backend(BackendKind::Simulated).unwrap();
        assert_eq!(backend.name(), "simulated");
        let source = backend.create_source().unwrap();
        assert_eq!(backend.query_state(source).unwrap(), SourceState::Initial);
    }
}
