//! Plaything 演示程序
//!
//! - tone：合成正弦波，边生成边送入 Stream
//! - play：symphonia 解码音频文件，按块送入 Stream
//! - formats：列出后端支持的 buffer 编码

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_utils::Backoff;

use plaything::audio::backend::{create_backend, Backend, BackendKind};
use plaything::audio::format::{AudioFormat, BufferFormat, Sample, SampleType};
use plaything::decode::AudioDecoder;
use plaything::engine::{
    PlaybackState, Stream, StreamConfig, UnderrunPolicy, DEFAULT_BUFFER_COUNT,
};

/// 每次生成 / 送入的帧数
const CHUNK_FRAMES: usize = 1024;

/// 状态行刷新间隔
const REPORT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "plaything")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Playback backend
    #[arg(long, value_enum, default_value = "simulated", global = true)]
    backend: BackendArg,

    /// Sample rate for generated audio
    #[arg(short, long, default_value = "44100", global = true)]
    rate: u32,

    /// Channel count for generated audio (1 or 2)
    #[arg(short, long, default_value = "2", global = true)]
    channels: u16,

    /// Size of each native buffer in milliseconds
    #[arg(short, long, default_value = "250", global = true)]
    buffer_ms: u32,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a generated sine tone
    Tone {
        /// Tone frequency in Hz
        #[arg(short, long, default_value = "440")]
        freq: f64,

        /// Duration in seconds
        #[arg(short, long, default_value = "3")]
        seconds: f64,

        /// Sample type of the generated stream
        #[arg(long, value_enum, default_value = "i16")]
        sample_type: SampleArg,
    },

    /// Decode and play an audio file
    Play {
        /// Audio file to play
        file: PathBuf,
    },

    /// List supported buffer formats
    Formats,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Simulated,
    Openal,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Simulated => BackendKind::Simulated,
            BackendArg::Openal => BackendKind::OpenAl,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SampleArg {
    U8,
    I16,
}

type DynStream = Stream<Box<dyn Backend>>;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match cli.command {
        Commands::Tone {
            freq,
            seconds,
            sample_type,
        } => match sample_type {
            SampleArg::I16 => play_tone(&cli, freq, seconds, SampleType::I16, &running, |v| {
                (v * i16::MAX as f64) as i16
            })?,
            SampleArg::U8 => play_tone(&cli, freq, seconds, SampleType::U8, &running, |v| {
                (128.0 + v * 127.0) as u8
            })?,
        },
        Commands::Play { ref file } => play_file(file, &cli, &running)?,
        Commands::Formats => show_formats(),
    }

    Ok(())
}

/// 列出 buffer 编码
fn show_formats() {
    println!("=== Buffer Formats ===\n");
    for tag in BufferFormat::ALL {
        println!(
            "  {:<10} 0x{:04X}  {:<4} {}ch",
            format!("{:?}", tag),
            tag.raw(),
            tag.sample_type(),
            tag.channels()
        );
    }
    println!("\nBackends: simulated{}", if cfg!(feature = "openal") { ", openal" } else { "" });
}

fn open_stream(cli: &Cli, format: AudioFormat) -> anyhow::Result<DynStream> {
    let backend = create_backend(cli.backend.into())?;
    let buffer_frames = (format.sample_rate as u64 * cli.buffer_ms as u64 / 1000).max(1);
    let config = StreamConfig {
        format,
        buffer_count: DEFAULT_BUFFER_COUNT,
        buffer_frames: Some(u32::try_from(buffer_frames)?),
        underrun_policy: UnderrunPolicy::Restart,
    };
    Ok(Stream::new(backend, config)?)
}

/// 播放正弦波
fn play_tone<S: Sample>(
    cli: &Cli,
    freq: f64,
    seconds: f64,
    sample_type: SampleType,
    running: &AtomicBool,
    convert: impl Fn(f64) -> S,
) -> anyhow::Result<()> {
    let format = AudioFormat::new(sample_type, cli.rate, cli.channels);
    format.validate()?;
    let stream = open_stream(cli, format)?;

    println!("Tone: {:.1} Hz for {:.1}s ({})", freq, seconds, format);

    let total_frames = (seconds * format.sample_rate as f64) as usize;
    let channels = format.samples_per_frame();
    let step = std::f64::consts::TAU * freq / format.sample_rate as f64;
    let mut player = Player::new(&stream, running);
    let mut chunk: Vec<S> = Vec::with_capacity(CHUNK_FRAMES * channels);
    let mut frame = 0;

    while frame < total_frames {
        let frames = CHUNK_FRAMES.min(total_frames - frame);
        chunk.clear();
        for n in frame..frame + frames {
            let value = convert((step * n as f64).sin() * 0.25);
            chunk.extend(std::iter::repeat(value).take(channels));
        }
        if !player.feed_all(&chunk, format)? {
            break;
        }
        frame += frames;
    }

    player.finish::<S>(format)?;
    if cli.verbose {
        println!("\n{}", stream.stats());
    }
    Ok(())
}

/// 解码并播放文件
fn play_file(file: &PathBuf, cli: &Cli, running: &AtomicBool) -> anyhow::Result<()> {
    let mut decoder = AudioDecoder::open(file)?;
    let info = decoder.info().clone();
    let format = info.output_format();

    println!("Plaything - Loading: {}", file.display());
    println!(
        "{} / {} | {} Hz | {}ch{}",
        info.format,
        info.codec,
        info.sample_rate,
        info.channels,
        info.bit_depth
            .map(|b| format!(" | {}-bit", b))
            .unwrap_or_default()
    );

    let stream = open_stream(cli, format)?;
    let mut player = Player::new(&stream, running);

    while let Some(chunk) = decoder.next_chunk()? {
        if !player.feed_all(chunk, format)? {
            break;
        }
    }

    player.finish::<i16>(format)?;
    if cli.verbose {
        println!("\n{}", stream.stats());
    }
    Ok(())
}

/// 送数据的循环：池满时开始播放，后端没空位时退避重试
struct Player<'a> {
    stream: &'a DynStream,
    running: &'a AtomicBool,
    last_report: Instant,
}

impl<'a> Player<'a> {
    fn new(stream: &'a DynStream, running: &'a AtomicBool) -> Self {
        Self {
            stream,
            running,
            last_report: Instant::now(),
        }
    }

    fn interrupted(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// 送入全部样本，被 Ctrl+C 打断时返回 false
    fn feed_all<S: Sample>(&mut self, samples: &[S], format: AudioFormat) -> anyhow::Result<bool> {
        let channels = format.samples_per_frame();
        let backoff = Backoff::new();
        let mut offset = 0;

        while samples.len() - offset >= channels {
            if self.interrupted() {
                return Ok(false);
            }

            let frames = self.stream.feed(&samples[offset..], format)?;
            if frames > 0 {
                offset += frames * channels;
                backoff.reset();
                continue;
            }

            // 预填充完成
            if self.stream.state() != PlaybackState::Playing {
                self.stream.play()?;
                log::debug!("Prefill complete, playback started");
            }

            self.report()?;
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_millis(5));
            } else {
                backoff.snooze();
            }
        }
        Ok(true)
    }

    /// 用静音补齐最后一个 buffer，等待队列播完
    fn finish<S: Sample>(&mut self, format: AudioFormat) -> anyhow::Result<()> {
        if !self.interrupted() {
            let pending = self.stream.stats().pending_frames;
            if pending > 0 {
                let pad = self.stream.buffer_frames() - pending;
                let silence = vec![S::SILENCE; pad * format.samples_per_frame()];
                self.feed_all(&silence, format)?;
            }
            self.stream.play()?;
        }

        while !self.interrupted() {
            if self.stream.queue_size()? == 0 || self.stream.is_starved()? {
                break;
            }
            self.report()?;
            std::thread::sleep(Duration::from_millis(20));
        }

        println!();
        self.stream.stop()?;
        Ok(())
    }

    /// 刷新状态行
    fn report(&mut self) -> anyhow::Result<()> {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return Ok(());
        }
        self.last_report = Instant::now();

        let position = self.stream.position()?;
        let stats = self.stream.stats();
        print!(
            "\r  {}  |  Queued: {:>6} frames  |  Buffers: {}/{}  |  Drops: {}  ",
            position,
            self.stream.queue_size()?,
            stats.queued_buffers,
            stats.buffer_count,
            stats.total_drops
        );
        io::stdout().flush()?;
        Ok(())
    }
}
