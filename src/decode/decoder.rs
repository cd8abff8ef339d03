//! 音频文件解码器
//!
//! 使用 symphonia 解码 FLAC / WAV / AIFF / MP3，输出交织的 i16 样本，
//! 可以直接送入 [`crate::engine::Stream::feed`]
//!
//! 后端 buffer 只支持单声道和立体声，多声道文件只保留前两个声道

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::audio::format::{AudioFormat, SampleType};

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    /// 源文件声道数
    pub channels: u16,
    pub bit_depth: Option<u32>,
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 容器格式（取自扩展名）
    pub format: String,
    pub codec: String,
}

impl AudioInfo {
    /// 输出格式：i16，最多两个声道
    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::new(SampleType::I16, self.sample_rate, self.channels.min(2))
    }
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    samples: Option<SampleBuffer<i16>>,
    /// 折叠到输出声道后的样本
    output: Vec<i16>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .unwrap_or(2);
        let total_frames = codec_params.n_frames;

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec: codec_name,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        if channels > 2 {
            log::warn!("{} channels in source, keeping the first two", channels);
        }

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            samples: None,
            output: Vec::new(),
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一块数据
    ///
    /// 返回交织的 i16 样本；`None` 表示文件结束
    pub fn next_chunk(&mut self) -> Result<Option<&[i16]>, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 跳过损坏的帧
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let src_channels = spec.channels.count();
            let needed = decoded.capacity();
            let fits = self
                .samples
                .as_ref()
                .map_or(false, |buf| buf.capacity() >= needed * src_channels);
            if !fits {
                self.samples = None;
            }
            let samples = self
                .samples
                .get_or_insert_with(|| SampleBuffer::new(needed as u64, spec));
            samples.copy_interleaved_ref(decoded);

            let out_channels = src_channels.min(2);
            if src_channels == out_channels {
                return Ok(Some(samples.samples()));
            }

            keep_channels(samples.samples(), src_channels, out_channels, &mut self.output);
            return Ok(Some(&self.output));
        }
    }
}

/// 每帧只保留前 `out_channels` 个样本
fn keep_channels(samples: &[i16], src_channels: usize, out_channels: usize, out: &mut Vec<i16>) {
    out.clear();
    for frame in samples.chunks_exact(src_channels) {
        out.extend_from_slice(&frame[..out_channels]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    /// 写一个 16-bit PCM WAV 到临时目录
    fn write_wav(name: &str, sample_rate: u32, channels: u16, samples: &[i16]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("plaything-{}-{}.wav", std::process::id(), name));
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;

        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        let mut file = File::create(&path).unwrap();
        file.write_all(&bytes).unwrap();
        path
    }

    fn decode_all(decoder: &mut AudioDecoder) -> Vec<i16> {
        let mut out = Vec::new();
        while let Some(chunk) = decoder.next_chunk().unwrap() {
            out.extend_from_slice(chunk);
        }
        out
    }

    #[test]
    fn test_decode_wav_stereo() {
        let samples: Vec<i16> = (0..2000).map(|i| (i * 7 - 7000) as i16).collect();
        let path = write_wav("stereo", 8000, 2, &samples);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        let info = decoder.info().clone();
        assert_eq!(info.sample_rate, 8000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.format, "WAV");
        assert_eq!(
            info.output_format(),
            AudioFormat::new(SampleType::I16, 8000, 2)
        );

        assert_eq!(decode_all(&mut decoder), samples);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_keep_first_two_channels() {
        // 3 声道：第三声道恒为 -1
        let samples: Vec<i16> = (0..300)
            .flat_map(|i| [i as i16, -(i as i16), -1])
            .collect();
        let mut out = Vec::new();
        keep_channels(&samples, 3, 2, &mut out);

        let expected: Vec<i16> = (0..300).flat_map(|i| [i as i16, -(i as i16)]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_output_format_caps_channels() {
        let info = AudioInfo {
            sample_rate: 48000,
            channels: 6,
            bit_depth: Some(24),
            total_frames: None,
            duration_secs: None,
            format: "FLAC".to_string(),
            codec: "flac".to_string(),
        };
        assert_eq!(
            info.output_format(),
            AudioFormat::new(SampleType::I16, 48000, 2)
        );
    }

    #[test]
    fn test_open_missing_file() {
        let err = AudioDecoder::open("/nonexistent/plaything.wav").err().unwrap();
        assert!(matches!(err, DecodeError::FileOpen(_)));
    }
}
