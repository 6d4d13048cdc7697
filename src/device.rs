//! Device Abstraction Boundary
//!
//! The lifecycle core never talks to a GPU API directly. Everything it needs
//! from a backend goes through the [`DeviceFactory`] trait: allocating opaque
//! object shells, compiling shader source off-thread, decoding image payloads
//! off-thread, and filling objects with data on the render thread.
//!
//! # Threading contract
//!
//! - [`DeviceFactory::create`], [`DeviceFactory::compile_shader`] and
//!   [`DeviceFactory::decode_image`] may be called from any thread.
//! - Every `load_*` and `update_*` method is called by the manager only from
//!   the bound render thread. Implementations may rely on this and skip
//!   internal synchronization for device context access.
//!
//! `load_*` methods report success as a `bool` rather than an error type;
//! a `false` drives the owning resource into `LoadedFailed`.

/// Opaque handle to a backend object.
///
/// The core stores and sequences these but never interprets them. `0` is
/// reserved as the null handle so backends can signal shell allocation
/// failure from [`DeviceFactory::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

impl DeviceHandle {
    /// The reserved invalid handle.
    pub const NULL: Self = Self(0);

    /// Whether this handle is the reserved invalid handle.
    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Kinds of backend objects the factory can allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceResourceKind {
    Program,
    Shader,
    Texture,
    VertexBuffer,
    IndexBuffer,
    ConstBuffer,
    Sampler,
    FrameBuffer,
    InputLayout,
}

/// Programmable pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    /// Shader model used when a compile request leaves the model empty.
    #[must_use]
    pub fn default_model(self) -> &'static str {
        match self {
            Self::Vertex => "vs_4_0",
            Self::Pixel => "ps_4_0",
        }
    }

    /// Short tag used in cache file names and log lines.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Vertex => "vs",
            Self::Pixel => "ps",
        }
    }
}

/// Texel formats understood by the core.
///
/// Deliberately small: only what keyed texture caches and frame buffer
/// descriptions need to distinguish. Backends map these onto native formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceFormat {
    #[default]
    Unknown,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    R16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth24Stencil8,
    Depth32Float,
    Bc1Unorm,
    Bc3Unorm,
}

impl ResourceFormat {
    /// Bytes per texel for uncompressed formats, `None` for block-compressed
    /// or unknown formats.
    #[must_use]
    pub fn bytes_per_texel(self) -> Option<usize> {
        match self {
            Self::R8Unorm => Some(1),
            Self::Rg8Unorm | Self::R16Float => Some(2),
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::R32Float
            | Self::Depth24Stencil8
            | Self::Depth32Float => Some(4),
            Self::Rgba16Float => Some(8),
            Self::Rgba32Float => Some(16),
            Self::Unknown | Self::Bc1Unorm | Self::Bc3Unorm => None,
        }
    }
}

/// One stage of a program compile request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ShaderCompileDesc {
    /// Entry point function name. An empty entry point means the stage is
    /// absent from the program and must be skipped entirely.
    pub entry_point: String,
    /// Target shader model. Empty selects the stage default.
    pub shader_model: String,
    /// Preprocessor macro definitions, `(name, value)` pairs.
    pub macros: Vec<(String, String)>,
}

impl ShaderCompileDesc {
    /// Whether this stage participates in the program at all.
    #[inline]
    #[must_use]
    pub fn is_present(&self) -> bool {
        !self.entry_point.is_empty()
    }

    /// The shader model to compile against, falling back to the stage default.
    #[must_use]
    pub fn model_or_default(&self, stage: ShaderStage) -> &str {
        if self.shader_model.is_empty() {
            stage.default_model()
        } else {
            &self.shader_model
        }
    }
}

/// Texture creation parameters. Dimensions come from the decoded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub format: ResourceFormat,
    pub autogen_mips: bool,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            format: ResourceFormat::Rgba8Unorm,
            autogen_mips: false,
        }
    }
}

/// Decoded texel payload ready for upload.
#[derive(Debug, Clone, Default)]
pub struct TexelData {
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub face_count: u32,
    pub format: ResourceFormat,
    pub bytes: Vec<u8>,
}

/// Texture filtering modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
    Anisotropic,
}

/// Texture coordinate addressing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Clamp,
    Mirror,
    Border,
}

/// Sampler comparison functions. `Never` means comparison is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    #[default]
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Sampler state description. One filter and one address mode cover all axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub compare: CompareFunc,
    pub address: AddressMode,
}

/// Buffer flavors tracked by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Const,
}

/// Memory usage hint forwarded to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HwUsage {
    #[default]
    Default,
    Immutable,
    Dynamic,
}

/// Buffer creation parameters.
///
/// `stride` is the per-element size for vertex buffers and the index width
/// (2 or 4) for index buffers; constant buffers leave it at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub usage: HwUsage,
    pub size: usize,
    pub stride: usize,
}

/// Frame buffer creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameBufferDesc {
    pub width: u32,
    pub height: u32,
    pub color_formats: Vec<ResourceFormat>,
    pub depth_format: Option<ResourceFormat>,
}

/// One element of a vertex input layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutElement {
    pub semantic: String,
    pub semantic_index: u32,
    pub format: ResourceFormat,
    pub offset: u32,
}

/// Vertex input layout description. Validation against a program happens in
/// the backend when the layout is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InputLayoutDesc {
    pub elements: Vec<LayoutElement>,
}

/// The backend boundary.
///
/// Implementations wrap a concrete GPU API (or record calls, for tests). The
/// manager owns exactly one factory and sequences every call per the module
/// level threading contract.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Short backend tag, used to partition the shader bytecode cache on
    /// disk (for example `"d3d11"`).
    fn platform(&self) -> &'static str;

    /// Allocates an empty backend object shell. Any thread.
    ///
    /// Returns [`DeviceHandle::NULL`] if the backend cannot allocate.
    fn create(&self, kind: DeviceResourceKind) -> DeviceHandle;

    /// Compiles shader source to bytecode. Any thread; must not touch the
    /// device context. `Err` carries the compiler diagnostic verbatim.
    fn compile_shader(
        &self,
        stage: ShaderStage,
        desc: &ShaderCompileDesc,
        source: &[u8],
    ) -> std::result::Result<Vec<u8>, String>;

    /// Decodes an image file payload into texel data. Any thread.
    fn decode_image(
        &self,
        desc: &TextureDesc,
        bytes: &[u8],
    ) -> std::result::Result<TexelData, String>;

    /// Fills a shader object with compiled bytecode. Render thread only.
    fn load_shader(&self, shader: DeviceHandle, stage: ShaderStage, bytecode: &[u8]) -> bool;

    /// Links stage shaders into a program object. Render thread only.
    fn load_program(&self, program: DeviceHandle, shaders: &[DeviceHandle]) -> bool;

    /// Uploads decoded texels into a texture object. Render thread only.
    fn load_texture(&self, texture: DeviceHandle, desc: &TextureDesc, data: &TexelData) -> bool;

    /// Creates backend storage for a buffer, optionally with initial
    /// contents. Render thread only.
    fn load_buffer(&self, buffer: DeviceHandle, desc: &BufferDesc, initial: &[u8]) -> bool;

    /// Realizes a sampler state object. Render thread only.
    fn load_sampler(&self, sampler: DeviceHandle, desc: &SamplerDesc) -> bool;

    /// Realizes a frame buffer with its attachments. Render thread only.
    fn load_frame_buffer(&self, frame_buffer: DeviceHandle, desc: &FrameBufferDesc) -> bool;

    /// Realizes an input layout, validated against a linked program.
    /// Render thread only.
    fn load_input_layout(
        &self,
        layout: DeviceHandle,
        program: DeviceHandle,
        desc: &InputLayoutDesc,
    ) -> bool;

    /// Overwrites buffer contents. Render thread only.
    fn update_buffer(&self, buffer: DeviceHandle, bytes: &[u8]) -> bool;
}
