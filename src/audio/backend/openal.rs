//! OpenAL 后端
//!
//! 直接链接系统 OpenAL（macOS: OpenAL.framework，其他平台: libopenal）
//! - 每个后端打开默认设备并拥有自己的 context
//! - 关闭距离衰减，listener 增益固定为 1.0，样本按原值输出
//! - 当前 context 是进程级状态：每次调用都在全局锁内先切换到本后端的
//!   context，清空 alGetError，调用后检查错误码

use std::ffi::{c_char, c_void};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Backend, BackendError, BufferId, ErrorCode, Op, SourceId, SourceState};
use crate::audio::format::BufferFormat;

type ALuint = u32;
type ALint = i32;
type ALenum = i32;
type ALsizei = i32;
type ALfloat = f32;
type ALCboolean = c_char;

#[repr(C)]
struct ALCdevice {
    _private: [u8; 0],
}

#[repr(C)]
struct ALCcontext {
    _private: [u8; 0],
}

const AL_NO_ERROR: ALenum = 0;
const AL_NONE: ALenum = 0;
const AL_GAIN: ALenum = 0x100A;
const AL_BUFFER: ALenum = 0x1009;
const AL_SOURCE_STATE: ALenum = 0x1010;
const AL_INITIAL: ALint = 0x1011;
const AL_PLAYING: ALint = 0x1012;
const AL_PAUSED: ALint = 0x1013;
const AL_STOPPED: ALint = 0x1014;
const AL_BUFFERS_QUEUED: ALenum = 0x1015;
const AL_BUFFERS_PROCESSED: ALenum = 0x1016;
const AL_SAMPLE_OFFSET: ALenum = 0x1025;

#[cfg_attr(target_os = "macos", link(name = "OpenAL", kind = "framework"))]
#[cfg_attr(not(target_os = "macos"), link(name = "openal"))]
extern "C" {
    fn alcOpenDevice(device_name: *const c_char) -> *mut ALCdevice;
    fn alcCloseDevice(device: *mut ALCdevice) -> ALCboolean;
    fn alcCreateContext(device: *mut ALCdevice, attrlist: *const ALint) -> *mut ALCcontext;
    fn alcMakeContextCurrent(context: *mut ALCcontext) -> ALCboolean;
    fn alcGetCurrentContext() -> *mut ALCcontext;
    fn alcDestroyContext(context: *mut ALCcontext);

    fn alGetError() -> ALenum;
    fn alDistanceModel(model: ALenum);
    fn alListenerf(param: ALenum, value: ALfloat);

    fn alGenSources(n: ALsizei, sources: *mut ALuint);
    fn alDeleteSources(n: ALsizei, sources: *const ALuint);
    fn alGenBuffers(n: ALsizei, buffers: *mut ALuint);
    fn alDeleteBuffers(n: ALsizei, buffers: *const ALuint);
    fn alBufferData(
        buffer: ALuint,
        format: ALenum,
        data: *const c_void,
        size: ALsizei,
        freq: ALsizei,
    );

    fn alSourceQueueBuffers(source: ALuint, n: ALsizei, buffers: *const ALuint);
    fn alSourceUnqueueBuffers(source: ALuint, n: ALsizei, buffers: *mut ALuint);
    fn alSourcePlay(source: ALuint);
    fn alSourcePause(source: ALuint);
    fn alSourceStop(source: ALuint);
    fn alSourcei(source: ALuint, param: ALenum, value: ALint);
    fn alGetSourcei(source: ALuint, param: ALenum, value: *mut ALint);
}

/// 设备句柄，Drop 时关闭
struct Device(*mut ALCdevice);

impl Drop for Device {
    fn drop(&mut self) {
        if unsafe { alcCloseDevice(self.0) } == 0 {
            log::warn!("alcCloseDevice failed");
        }
    }
}

/// 切换当前 context 和随后的 AL 调用之间不能被其他后端打断
static AL_LOCK: Mutex<()> = Mutex::new(());

fn al_lock() -> MutexGuard<'static, ()> {
    AL_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// context 句柄，Drop 时销毁；只有它仍是当前 context 时才取消 current
struct Context(*mut ALCcontext);

impl Drop for Context {
    fn drop(&mut self) {
        let _guard = al_lock();
        unsafe {
            if alcGetCurrentContext() == self.0 {
                alcMakeContextCurrent(ptr::null_mut());
            }
            alcDestroyContext(self.0);
        }
    }
}

/// alGetError 结果 → 某个操作的错误
fn check_call(op: Op, code: ALenum) -> Result<(), BackendError> {
    match code {
        AL_NO_ERROR => Ok(()),
        code => Err(BackendError::Call {
            op,
            code: ErrorCode::from_raw(code),
        }),
    }
}

/// listener 设置不属于任何 source 操作，失败算初始化失败
fn check_setup(code: ALenum) -> Result<(), BackendError> {
    match code {
        AL_NO_ERROR => Ok(()),
        code => Err(BackendError::Init(format!(
            "OpenAL listener setup failed: {}",
            ErrorCode::from_raw(code)
        ))),
    }
}

fn count(op: Op, n: usize) -> Result<ALsizei, BackendError> {
    ALsizei::try_from(n).map_err(|_| BackendError::Call {
        op,
        code: ErrorCode::InvalidValue,
    })
}

/// 系统 OpenAL 后端
pub struct OpenAlBackend {
    // 字段按声明顺序 drop：context 必须先于 device 释放
    context: Context,
    device: Device,
}

// 所有 AL 调用都在 AL_LOCK 内切换到自己的 context，句柄可以跨线程移动
unsafe impl Send for OpenAlBackend {}

impl OpenAlBackend {
    /// 打开默认输出设备
    pub fn open_default() -> Result<Self, BackendError> {
        let raw = unsafe { alcOpenDevice(ptr::null()) };
        if raw.is_null() {
            return Err(BackendError::Init("no OpenAL output device".to_string()));
        }
        let device = Device(raw);

        let raw = unsafe { alcCreateContext(device.0, ptr::null()) };
        if raw.is_null() {
            return Err(BackendError::Init("failed to create OpenAL context".to_string()));
        }
        let context = Context(raw);

        // 出错时先放锁，再由 Context::drop 销毁
        let setup = {
            let _guard = al_lock();
            if unsafe { alcMakeContextCurrent(context.0) } == 0 {
                Err(BackendError::Init(
                    "failed to make OpenAL context current".to_string(),
                ))
            } else {
                check_setup(unsafe {
                    alGetError();
                    alDistanceModel(AL_NONE);
                    alListenerf(AL_GAIN, 1.0);
                    alGetError()
                })
            }
        };
        setup?;

        log::info!("OpenAL device opened");
        Ok(Self { context, device })
    }

    /// 在本后端的 context 上执行一次 AL 调用并检查错误
    fn call<T>(&self, op: Op, f: impl FnOnce() -> T) -> Result<T, BackendError> {
        let _guard = al_lock();
        if unsafe { alcMakeContextCurrent(self.context.0) } == 0 {
            return Err(BackendError::Call {
                op,
                code: ErrorCode::InvalidOperation,
            });
        }
        unsafe {
            alGetError();
        }
        let value = f();
        check_call(op, unsafe { alGetError() })?;
        Ok(value)
    }

    fn get_source_int(&self, op: Op, source: SourceId, param: ALenum) -> Result<ALint, BackendError> {
        let mut value: ALint = 0;
        self.call(op, || unsafe { alGetSourcei(source.0, param, &mut value) })?;
        Ok(value)
    }
}

impl Drop for OpenAlBackend {
    fn drop(&mut self) {
        log::debug!(
            "Closing OpenAL device {:p} (context {:p})",
            self.device.0,
            self.context.0
        );
    }
}

impl Backend for OpenAlBackend {
    fn name(&self) -> &'static str {
        "openal"
    }

    fn create_source(&mut self) -> Result<SourceId, BackendError> {
        let mut id: ALuint = 0;
        self.call(Op::CreateSource, || unsafe { alGenSources(1, &mut id) })?;
        Ok(SourceId(id))
    }

    fn create_buffers(&mut self, n: usize) -> Result<Vec<BufferId>, BackendError> {
        let len = count(Op::CreateBuffers, n)?;
        let mut ids: Vec<ALuint> = vec![0; n];
        self.call(Op::CreateBuffers, || unsafe { alGenBuffers(len, ids.as_mut_ptr()) })?;
        Ok(ids.into_iter().map(BufferId).collect())
    }

    fn submit(
        &mut self,
        buffer: BufferId,
        format: BufferFormat,
        data: &[u8],
        sample_rate: u32,
    ) -> Result<(), BackendError> {
        let size = count(Op::Submit, data.len())?;
        let freq = count(Op::Submit, sample_rate as usize)?;
        self.call(Op::Submit, || unsafe {
            alBufferData(
                buffer.0,
                format.raw(),
                data.as_ptr() as *const c_void,
                size,
                freq,
            )
        })
    }

    fn enqueue(&mut self, source: SourceId, buffer: BufferId) -> Result<(), BackendError> {
        self.call(Op::Enqueue, || unsafe {
            alSourceQueueBuffers(source.0, 1, &buffer.0)
        })
    }

    fn dequeue_processed(
        &mut self,
        source: SourceId,
        max: usize,
    ) -> Result<Vec<BufferId>, BackendError> {
        let len = count(Op::DequeueProcessed, max)?;
        let mut ids: Vec<ALuint> = vec![0; max];
        self.call(Op::DequeueProcessed, || unsafe {
            alSourceUnqueueBuffers(source.0, len, ids.as_mut_ptr())
        })?;
        Ok(ids.into_iter().map(BufferId).collect())
    }

    fn play(&mut self, source: SourceId) -> Result<(), BackendError> {
        self.call(Op::Play, || unsafe { alSourcePlay(source.0) })
    }

    fn pause(&mut self, source: SourceId) -> Result<(), BackendError> {
        self.call(Op::Pause, || unsafe { alSourcePause(source.0) })
    }

    fn stop(&mut self, source: SourceId) -> Result<(), BackendError> {
        self.call(Op::Stop, || unsafe { alSourceStop(source.0) })
    }

    fn detach_all(&mut self, source: SourceId) -> Result<(), BackendError> {
        self.call(Op::DetachAll, || unsafe { alSourcei(source.0, AL_BUFFER, 0) })
    }

    fn query_state(&mut self, source: SourceId) -> Result<SourceState, BackendError> {
        let state = match self.get_source_int(Op::QueryState, source, AL_SOURCE_STATE)? {
            AL_INITIAL => SourceState::Initial,
            AL_PLAYING => SourceState::Playing,
            AL_PAUSED => SourceState::Paused,
            AL_STOPPED => SourceState::Stopped,
            other => {
                log::warn!("Unknown source state 0x{:X}", other);
                SourceState::Stopped
            }
        };
        Ok(state)
    }

    fn query_sample_offset(&mut self, source: SourceId) -> Result<usize, BackendError> {
        let offset = self.get_source_int(Op::QuerySampleOffset, source, AL_SAMPLE_OFFSET)?;
        Ok(offset.max(0) as usize)
    }

    fn query_buffers_queued(&mut self, source: SourceId) -> Result<usize, BackendError> {
        let n = self.get_source_int(Op::QueryBuffersQueued, source, AL_BUFFERS_QUEUED)?;
        Ok(n.max(0) as usize)
    }

    fn query_buffers_processed(&mut self, source: SourceId) -> Result<usize, BackendError> {
        let n = self.get_source_int(Op::QueryBuffersProcessed, source, AL_BUFFERS_PROCESSED)?;
        Ok(n.max(0) as usize)
    }

    fn delete_buffers(&mut self, buffers: &[BufferId]) -> Result<(), BackendError> {
        let len = count(Op::DeleteBuffers, buffers.len())?;
        let ids: Vec<ALuint> = buffers.iter().map(|b| b.0).collect();
        self.call(Op::DeleteBuffers, || unsafe { alDeleteBuffers(len, ids.as_ptr()) })
    }

    fn delete_source(&mut self, source: SourceId) -> Result<(), BackendError> {
        self.call(Op::DeleteSource, || unsafe { alDeleteSources(1, &source.0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_is_init_failure() {
        assert!(check_setup(AL_NO_ERROR).is_ok());
        let err = check_setup(0xA003).unwrap_err();
        assert_eq!(
            err,
            BackendError::Init("OpenAL listener setup failed: invalid_value".to_string())
        );
    }

    #[test]
    fn test_call_error_names_operation() {
        assert!(check_call(Op::Play, AL_NO_ERROR).is_ok());
        assert_eq!(
            check_call(Op::Enqueue, 0xA004).unwrap_err(),
            BackendError::Call {
                op: Op::Enqueue,
                code: ErrorCode::InvalidOperation,
            }
        );
    }

    #[test]
    #[ignore] // 需要实际音频设备
    fn test_backends_keep_their_own_context() {
        let mut first = OpenAlBackend::open_default().unwrap();
        let source = first.create_source().unwrap();

        let mut second = OpenAlBackend::open_default().unwrap();
        let other = second.create_source().unwrap();
        second.delete_source(other).unwrap();
        drop(second);

        // 另一个后端销毁后，这个后端的 source 仍然有效
        assert_eq!(first.query_state(source).unwrap(), SourceState::Initial);
        let buffers = first.create_buffers(2).unwrap();
        first.delete_buffers(&buffers).unwrap();
        first.delete_source(source).unwrap();
    }
}
