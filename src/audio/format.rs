//! 音频格式和样本编码
//!
//! 格式 = 采样类型 + 采样率 + 声道数
//! 只有有限的 (采样类型, 声道数) 组合能映射到后端 buffer 编码：
//! - U8  × 1ch → Mono8
//! - I16 × 1ch → Mono16
//! - U8  × 2ch → Stereo8
//! - I16 × 2ch → Stereo16
//!
//! 样本按交织顺序（LRLRLR...）原样转发，不做任何转换

use std::fmt;

use thiserror::Error;

/// 采样类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleType {
    /// 无符号 8-bit，静音 = 128
    U8,
    /// 有符号 16-bit，本机字节序
    I16,
}

impl SampleType {
    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I16 => "i16",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 后端 buffer 编码标签
///
/// 数值与 OpenAL 的 AL_FORMAT_* 常量一致，OpenAL 后端直接透传
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BufferFormat {
    Mono8 = 0x1100,
    Mono16 = 0x1101,
    Stereo8 = 0x1102,
    Stereo16 = 0x1103,
}

impl BufferFormat {
    /// 全部受支持的组合
    pub const ALL: [BufferFormat; 4] = [
        BufferFormat::Mono8,
        BufferFormat::Mono16,
        BufferFormat::Stereo8,
        BufferFormat::Stereo16,
    ];

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }

    pub fn sample_type(self) -> SampleType {
        match self {
            Self::Mono8 | Self::Stereo8 => SampleType::U8,
            Self::Mono16 | Self::Stereo16 => SampleType::I16,
        }
    }

    pub fn channels(self) -> u16 {
        match self {
            Self::Mono8 | Self::Mono16 => 1,
            Self::Stereo8 | Self::Stereo16 => 2,
        }
    }
}

/// 格式配置错误
///
/// 在设置格式时同步抛出，绝不静默修正
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error("channel count must be positive")]
    ZeroChannels,
    #[error("unsupported sample format: {sample_type} x {channels}ch")]
    Unsupported { sample_type: SampleType, channels: u16 },
    #[error("sample data is {actual}, but the format declares {expected}")]
    SampleTypeMismatch {
        expected: SampleType,
        actual: SampleType,
    },
}

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_type: SampleType,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// 创建新的音频格式（不校验，校验见 [`AudioFormat::buffer_format`]）
    pub const fn new(sample_type: SampleType, sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_type,
            sample_rate,
            channels,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_type.bytes_per_sample() * self.channels as usize
    }

    /// 校验并返回对应的后端 buffer 编码
    pub fn buffer_format(&self) -> Result<BufferFormat, FormatError> {
        if self.sample_rate == 0 {
            return Err(FormatError::ZeroSampleRate);
        }
        if self.channels == 0 {
            return Err(FormatError::ZeroChannels);
        }

        match (self.sample_type, self.channels) {
            (SampleType::U8, 1) => Ok(BufferFormat::Mono8),
            (SampleType::I16, 1) => Ok(BufferFormat::Mono16),
            (SampleType::U8, 2) => Ok(BufferFormat::Stereo8),
            (SampleType::I16, 2) => Ok(BufferFormat::Stereo16),
            (sample_type, channels) => Err(FormatError::Unsupported {
                sample_type,
                channels,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), FormatError> {
        self.buffer_format().map(|_| ())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(SampleType::I16, 44100, 2)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch",
            self.sample_type, self.sample_rate, self.channels
        )
    }
}

/// 可直接送入 Stream 的样本类型
pub trait Sample: Copy + Send + 'static {
    const TYPE: SampleType;
    /// 静音值
    const SILENCE: Self;

    /// 追加到交织字节流（后端要求的本机字节序）
    fn encode(samples: &[Self], out: &mut Vec<u8>);
}

impl Sample for u8 {
    const TYPE: SampleType = SampleType::U8;
    const SILENCE: Self = 128;

    #[inline]
    fn encode(samples: &[Self], out: &mut Vec<u8>) {
        out.extend_from_slice(samples);
    }
}

impl Sample for i16 {
    const TYPE: SampleType = SampleType::I16;
    const SILENCE: Self = 0;

    #[inline]
    fn encode(samples: &[Self], out: &mut Vec<u8>) {
        out.reserve(samples.len() * 2);
        for sample in samples {
            out.extend_from_slice(&sample.to_ne_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.sample_type, SampleType::I16);
        assert_eq!(format.sample_rate, 44100);
        assert_eq!(format.channels, 2);
        assert_eq!(format.buffer_format(), Ok(BufferFormat::Stereo16));
        assert_eq!(format.bytes_per_frame(), 4);
    }

    #[test]
    fn test_supported_pairs() {
        for tag in BufferFormat::ALL {
            let format = AudioFormat::new(tag.sample_type(), 22050, tag.channels());
            assert_eq!(format.buffer_format(), Ok(tag));
        }
        assert_eq!(BufferFormat::Stereo16.raw(), 0x1103);
        assert_eq!(BufferFormat::Mono8.raw(), 0x1100);
    }

    #[test]
    fn test_rejects_invalid_formats() {
        assert_eq!(
            AudioFormat::new(SampleType::I16, 0, 2).validate(),
            Err(FormatError::ZeroSampleRate)
        );
        assert_eq!(
            AudioFormat::new(SampleType::I16, 44100, 0).validate(),
            Err(FormatError::ZeroChannels)
        );
        assert_eq!(
            AudioFormat::new(SampleType::I16, 44100, 6).validate(),
            Err(FormatError::Unsupported {
                sample_type: SampleType::I16,
                channels: 6
            })
        );
    }

    #[test]
    fn test_i16_encoding_native_endian() {
        let mut out = Vec::new();
        i16::encode(&[1, -2], &mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(i16::from_ne_bytes([out[0], out[1]]), 1);
        assert_eq!(i16::from_ne_bytes([out[2], out[3]]), -2);

        let mut out = Vec::new();
        u8::encode(&[0, 128, 255], &mut out);
        assert_eq!(out, vec![0, 128, 255]);
    }
}
