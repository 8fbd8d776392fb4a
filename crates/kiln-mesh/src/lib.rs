//! Kiln Mesh - GLB validation and normalization
//!
//! Loads generated glTF/GLB models, flattens them into world-space
//! primitives grouped by material, and applies the decimation, uniform
//! scaling and pivot placement a caller asks for before the artifact is
//! cached. Materials, textures and embedded images are carried through.

mod decimate;
mod glb_writer;
mod load;
mod normalize;
mod shapes;
mod types;
mod validate;

pub use decimate::decimate;
pub use glb_writer::{encode_glb, encode_model, write_glb, write_model};
pub use load::load_model;
pub use normalize::{
    pivot_origin, uniform_scale_factor, MeshNormalizer, NormalizeOptions, NormalizeReport,
};
pub use shapes::box_mesh;
pub use types::{
    ImageData, ImageSource, LoadedModel, MaterialInfo, MaterialSet, MeshBounds, MeshData,
    SurfacePart,
};
pub use validate::{validate_mesh, MeshReport, LARGE_FILE_WARN_BYTES};
