//! 文件解码（演示程序的 `play` 命令使用）

mod decoder;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError};
