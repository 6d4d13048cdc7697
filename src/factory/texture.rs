//! Texture Build Pipeline
//!
//! File-backed textures are deduplicated by absolute path and requested
//! format; raw-data textures are one-offs. The file build reads and decodes
//! in the worker domain and uploads in the render domain.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use futures::FutureExt;

use crate::cache::KeyedCache;
use crate::device::{DeviceHandle, DeviceResourceKind, ResourceFormat, TexelData, TextureDesc};
use crate::errors::Result;
use crate::factory::upload_body;
use crate::manager::ManagerCore;
use crate::resource::{DeviceResource, LoadGuard, ResourceCore, ResourceId, ResourceKind};
use crate::task::{BuildFuture, Launch};

/// Deduplication key for file-backed textures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureKey {
    /// Absolute source path.
    pub path: String,
    pub format: ResourceFormat,
}

/// A texture object with metadata derived after upload.
pub struct TextureResource {
    core: ResourceCore,
    desc: TextureDesc,
    handle: DeviceHandle,
    width: AtomicU32,
    height: AtomicU32,
    uploaded: AtomicU64,
    byte_size: AtomicU64,
}

impl TextureResource {
    fn new(
        id: ResourceId,
        label: impl Into<String>,
        desc: TextureDesc,
        handle: DeviceHandle,
    ) -> Self {
        Self {
            core: ResourceCore::new(id, label),
            desc,
            handle,
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            uploaded: AtomicU64::new(0),
            byte_size: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Texel dimensions of the decoded payload, `(0, 0)` until decode.
    #[must_use]
    pub fn extent(&self) -> (u32, u32) {
        (self.width.load(Ordering::Acquire), self.height.load(Ordering::Acquire))
    }

    /// Resident payload size in bytes. Zero until the texture is loaded.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.byte_size.load(Ordering::Acquire)
    }

    pub(crate) fn record_payload(&self, data: &TexelData) {
        self.width.store(data.width, Ordering::Release);
        self.height.store(data.height, Ordering::Release);
        self.uploaded.store(data.bytes.len() as u64, Ordering::Release);
    }
}

impl DeviceResource for TextureResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Texture
    }

    // Derive the resident footprint once the upload really happened. Falls
    // back to dimensions and format for backends that upload borrowed data.
    fn on_loaded(&self) {
        let uploaded = self.uploaded.load(Ordering::Acquire);
        let size = if uploaded > 0 {
            uploaded
        } else {
            let (w, h) = self.extent();
            self.desc
                .format
                .bytes_per_texel()
                .map_or(0, |bpp| u64::from(w) * u64::from(h) * bpp as u64)
        };
        self.byte_size.store(size, Ordering::Release);
        let (w, h) = self.extent();
        log::trace!("texture {} resident ({w}x{h}, {size} bytes)", self.core.label());
    }
}

/// Builds textures and deduplicates the file-backed ones.
pub struct TextureFactory {
    core: Arc<ManagerCore>,
    cache: KeyedCache<TextureKey, Arc<TextureResource>>,
}

impl TextureFactory {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        Self {
            core,
            cache: KeyedCache::new(),
        }
    }

    /// Returns the shared texture for `path` + format, starting a build on
    /// the first request.
    pub fn create_from_file(
        &self,
        launch: Launch,
        path: &Path,
        desc: TextureDesc,
    ) -> Result<Arc<TextureResource>> {
        self.core.ensure_live()?;
        let canonical = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let key = TextureKey {
            path: canonical.display().to_string(),
            format: desc.format,
        };
        let (res, inserted) = self.cache.get_or_add(&key, || {
            let shell = self.core.device.create(DeviceResourceKind::Texture);
            self.core.register(|id| TextureResource::new(id, key.path.clone(), desc, shell))
        });
        if inserted {
            res.core().set_origin(key.path.clone());
            res.set_prepared();
            self.core.track(res.core().id());
            let body = self.file_body(launch, &res, canonical);
            self.core.queue_build(res.core().id(), launch, body);
            if launch == Launch::Sync {
                self.core.drive_now(res.core().id())?;
            }
        } else if launch == Launch::Sync && !res.is_load_complete() {
            self.core.wait_settled(res.as_ref())?;
        }
        Ok(res)
    }

    /// Creates a texture from an already decoded payload. Never cached.
    pub fn create_from_data(
        &self,
        launch: Launch,
        label: &str,
        desc: TextureDesc,
        data: TexelData,
    ) -> Result<Arc<TextureResource>> {
        self.core.ensure_live()?;
        let shell = self.core.device.create(DeviceResourceKind::Texture);
        let res = self.core.register(|id| TextureResource::new(id, label, desc, shell));
        res.record_payload(&data);
        res.set_prepared();
        self.core.track(res.core().id());

        let device = Arc::clone(&self.core.device);
        let body = upload_body(
            self.core.scheduler.dispatcher(),
            Arc::clone(&res) as Arc<dyn DeviceResource>,
            move || {
                if shell.is_null() {
                    return Err("device refused to allocate a texture object".into());
                }
                Ok(device.load_texture(shell, &desc, &data))
            },
        );
        self.core.queue_build(res.core().id(), launch, body);
        if launch == Launch::Sync {
            self.core.drive_now(res.core().id())?;
        }
        Ok(res)
    }

    fn file_body(&self, launch: Launch, res: &Arc<TextureResource>, path: PathBuf) -> BuildFuture {
        let dispatcher = self.core.scheduler.dispatcher();
        let decode_device = Arc::clone(&self.core.device);
        let upload_device = Arc::clone(&self.core.device);
        let desc = res.desc();
        let shell = res.device_handle();
        let res = Arc::clone(res);
        let guard = LoadGuard::new(Arc::clone(&res) as Arc<dyn DeviceResource>);
        async move {
            res.set_loading();
            let decoded = dispatcher
                .offload(launch, move || -> std::result::Result<TexelData, String> {
                    let bytes = fs::read(&path).map_err(|err| {
                        format!("failed to read texture {}: {err}", path.display())
                    })?;
                    decode_device.decode_image(&desc, &bytes)
                })
                .await;
            let data = match decoded {
                Ok(Ok(data)) => data,
                Ok(Err(diagnostic)) => return guard.fail(diagnostic),
                Err(err) => return guard.fail(err.to_string()),
            };
            res.record_payload(&data);
            let uploaded = dispatcher
                .render()
                .run(move || -> std::result::Result<bool, String> {
                    if shell.is_null() {
                        return Err("device refused to allocate a texture object".into());
                    }
                    Ok(upload_device.load_texture(shell, &desc, &data))
                })
                .await;
            match uploaded {
                Ok(Ok(true)) => guard.finish(true),
                Ok(Ok(false)) => guard.fail("device rejected the texture upload"),
                Ok(Err(diagnostic)) => guard.fail(diagnostic),
                Err(err) => guard.fail(err.to_string()),
            }
        }
        .boxed()
    }

    pub(crate) fn purge(&self) {
        self.cache.clear();
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
