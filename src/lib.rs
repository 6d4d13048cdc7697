#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

pub mod resource;
pub mod graph;
pub mod cache;
pub mod device;
pub mod task;
pub mod factory;
pub mod manager;
pub mod errors;

pub use resource::{DeviceResource, LoadWatch, ResourceId, ResourceKind, ResourceState};
pub use device::{
    AddressMode, BufferDesc, BufferKind, CompareFunc, DeviceFactory, DeviceHandle,
    DeviceResourceKind, FilterMode, FrameBufferDesc, HwUsage, InputLayoutDesc, LayoutElement,
    ResourceFormat, SamplerDesc, ShaderCompileDesc, ShaderStage, TexelData, TextureDesc,
};
pub use task::Launch;
pub use factory::material::{
    MaterialKey, MaterialPlan, MaterialPlanSource, MaterialResource, ParamDef, ParameterBlock,
    Pass, PassPlan, Technique, TechniquePlan, TexturePlan,
};
pub use factory::objects::{
    BufferResource, FrameBufferResource, InputLayoutResource, SamplerResource,
};
pub use factory::program::{ProgramKey, ProgramResource};
pub use factory::texture::{TextureKey, TextureResource};
pub use manager::{ManagerOptions, ResourceManager};
pub use errors::{KilnError, Result};
