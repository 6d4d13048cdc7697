//! Shared test fixtures: a recording mock backend and driver helpers.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kiln::{
    BufferDesc, DeviceFactory, DeviceHandle, DeviceResourceKind, FrameBufferDesc, InputLayoutDesc,
    ManagerOptions, ResourceManager, SamplerDesc, ShaderCompileDesc, ShaderStage, TexelData,
    TextureDesc,
};

/// Backend stand-in that records every call and the thread it came from.
///
/// Failure knobs: shader source containing `BROKEN` fails compilation,
/// image payloads starting with `BAD` fail decoding, and `reject_updates`
/// makes `update_buffer` report failure.
pub struct MockDevice {
    next_handle: AtomicU64,
    pub compiles: AtomicUsize,
    pub links: AtomicUsize,
    pub texture_uploads: AtomicUsize,
    pub sampler_loads: AtomicUsize,
    pub frame_buffer_loads: AtomicUsize,
    pub layout_loads: AtomicUsize,
    pub buffer_updates: AtomicUsize,
    /// Initial-contents length of every buffer load, in load order.
    pub buffer_bytes: Mutex<Vec<usize>>,
    pub compile_threads: Mutex<Vec<ThreadId>>,
    pub load_threads: Mutex<Vec<ThreadId>>,
    pub reject_updates: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            compiles: AtomicUsize::new(0),
            links: AtomicUsize::new(0),
            texture_uploads: AtomicUsize::new(0),
            sampler_loads: AtomicUsize::new(0),
            frame_buffer_loads: AtomicUsize::new(0),
            layout_loads: AtomicUsize::new(0),
            buffer_updates: AtomicUsize::new(0),
            buffer_bytes: Mutex::new(Vec::new()),
            compile_threads: Mutex::new(Vec::new()),
            load_threads: Mutex::new(Vec::new()),
            reject_updates: AtomicBool::new(false),
        }
    }

    pub fn buffer_uploads(&self) -> usize {
        self.buffer_bytes.lock().len()
    }

    fn record_load(&self) {
        self.load_threads.lock().push(thread::current().id());
    }
}

impl DeviceFactory for MockDevice {
    fn platform(&self) -> &'static str {
        "mock"
    }

    fn create(&self, _kind: DeviceResourceKind) -> DeviceHandle {
        DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn compile_shader(
        &self,
        stage: ShaderStage,
        desc: &ShaderCompileDesc,
        source: &[u8],
    ) -> Result<Vec<u8>, String> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.compile_threads.lock().push(thread::current().id());
        if String::from_utf8_lossy(source).contains("BROKEN") {
            return Err(format!("syntax error near BROKEN in {}", desc.entry_point));
        }
        Ok(format!("BC[{}:{}]", stage.tag(), desc.entry_point).into_bytes())
    }

    fn decode_image(&self, desc: &TextureDesc, bytes: &[u8]) -> Result<TexelData, String> {
        if bytes.starts_with(b"BAD") {
            return Err("unrecognized image header".into());
        }
        Ok(TexelData {
            width: 2,
            height: 2,
            mip_count: 1,
            face_count: 1,
            format: desc.format,
            bytes: bytes.to_vec(),
        })
    }

    fn load_shader(&self, _shader: DeviceHandle, _stage: ShaderStage, _bytecode: &[u8]) -> bool {
        self.record_load();
        true
    }

    fn load_program(&self, _program: DeviceHandle, _shaders: &[DeviceHandle]) -> bool {
        self.record_load();
        self.links.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn load_texture(&self, _texture: DeviceHandle, _desc: &TextureDesc, _data: &TexelData) -> bool {
        self.record_load();
        self.texture_uploads.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn load_buffer(&self, _buffer: DeviceHandle, _desc: &BufferDesc, initial: &[u8]) -> bool {
        self.record_load();
        self.buffer_bytes.lock().push(initial.len());
        true
    }

    fn load_sampler(&self, _sampler: DeviceHandle, _desc: &SamplerDesc) -> bool {
        self.record_load();
        self.sampler_loads.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn load_frame_buffer(&self, _frame_buffer: DeviceHandle, _desc: &FrameBufferDesc) -> bool {
        self.record_load();
        self.frame_buffer_loads.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn load_input_layout(
        &self,
        _layout: DeviceHandle,
        _program: DeviceHandle,
        _desc: &InputLayoutDesc,
    ) -> bool {
        self.record_load();
        self.layout_loads.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn update_buffer(&self, _buffer: DeviceHandle, _bytes: &[u8]) -> bool {
        if self.reject_updates.load(Ordering::SeqCst) {
            return false;
        }
        self.buffer_updates.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Fresh scratch directory under the system temp dir, emptied per call.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kiln-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Manager over a fresh mock device, bytecode cache disabled.
pub fn mock_manager(shader_dir: PathBuf) -> (Arc<MockDevice>, ResourceManager) {
    mock_manager_with(shader_dir, false)
}

pub fn mock_manager_with(
    shader_dir: PathBuf,
    bytecode_cache: bool,
) -> (Arc<MockDevice>, ResourceManager) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(MockDevice::new());
    let manager = ResourceManager::new(
        Arc::clone(&device) as Arc<dyn DeviceFactory>,
        ManagerOptions {
            worker_threads: 2,
            shader_dir,
            bytecode_cache,
        },
    )
    .unwrap();
    (device, manager)
}

/// Ticks the manager until the dependency graph drains.
pub fn drain(manager: &ResourceManager) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.pending_loads() > 0 {
        assert!(
            Instant::now() < deadline,
            "loads did not settle within 10 seconds"
        );
        manager.update_for_loading().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
}
