//! 音频核心模块
//!
//! 包含：
//! - Format: 音频格式、后端 buffer 编码和样本编码
//! - Backend: 原生播放后端抽象（模拟 / OpenAL）
//! - Stats: 播放位置和统计

pub mod backend;
pub mod format;
pub mod stats;

pub use backend::{create_backend, Backend, BackendError, BackendKind};
pub use format::{AudioFormat, BufferFormat, FormatError, Sample, SampleType};
pub use stats::{Position, StatsReport};
