//! Mesh data types

use kiln_core::Vec3;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Axis-aligned bounding box computed from vertex positions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshBounds {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl MeshBounds {
    /// Compute bounds from a set of vertex positions
    pub fn from_positions(positions: &[[f32; 3]]) -> Option<Self> {
        let first = *positions.first()?;
        let mut min = first;
        let mut max = first;
        for p in positions.iter().skip(1) {
            for i in 0..3 {
                if p[i] < min[i] {
                    min[i] = p[i];
                }
                if p[i] > max[i] {
                    max[i] = p[i];
                }
            }
        }
        Some(Self { min, max })
    }

    /// Size along each axis
    pub fn size(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    pub fn min_vec(&self) -> Vec3 {
        Vec3::from_array(self.min)
    }

    pub fn max_vec(&self) -> Vec3 {
        Vec3::from_array(self.max)
    }

    /// Merge with another bounds to get the union
    pub fn union(&self, other: &MeshBounds) -> MeshBounds {
        MeshBounds {
            min: self.min_vec().min(&other.min_vec()).to_array(),
            max: self.max_vec().max(&other.max_vec()).to_array(),
        }
    }
}

impl std::fmt::Display for MeshBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.size();
        write!(
            f,
            "{:.2} x {:.2} x {:.2} (min [{:.2}, {:.2}, {:.2}], max [{:.2}, {:.2}, {:.2}])",
            s[0], s[1], s[2],
            self.min[0], self.min[1], self.min[2],
            self.max[0], self.max[1], self.max[2],
        )
    }
}

/// Triangle-list geometry in a single coordinate space.
///
/// `normals` and `uvs` are either empty or exactly one entry per position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn bounds(&self) -> Option<MeshBounds> {
        MeshBounds::from_positions(&self.positions)
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty() && self.normals.len() == self.positions.len()
    }

    pub fn has_uvs(&self) -> bool {
        !self.uvs.is_empty() && self.uvs.len() == self.positions.len()
    }

    /// Concatenate several meshes into one, offsetting indices.
    ///
    /// When only some parts carry normals the rest get face normals; missing
    /// UVs are zero-filled.
    pub fn concatenate(parts: &[MeshData]) -> MeshData {
        let any_normals = parts.iter().any(|m| m.has_normals());
        let any_uvs = parts.iter().any(|m| m.has_uvs());

        let mut out = MeshData::default();
        for part in parts {
            let offset = out.positions.len() as u32;
            out.positions.extend_from_slice(&part.positions);
            if any_normals {
                if part.has_normals() {
                    out.normals.extend_from_slice(&part.normals);
                } else {
                    out.normals.extend(part.compute_normals());
                }
            }
            if any_uvs {
                if part.has_uvs() {
                    out.uvs.extend_from_slice(&part.uvs);
                } else {
                    out.uvs
                        .extend(std::iter::repeat([0.0, 0.0]).take(part.vertex_count()));
                }
            }
            out.indices.extend(part.indices.iter().map(|i| i + offset));
        }
        out
    }

    /// Area-weighted vertex normals from the triangle list
    pub fn compute_normals(&self) -> Vec<[f32; 3]> {
        let mut acc = vec![glam::Vec3::ZERO; self.positions.len()];
        for tri in self.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
            if a.max(b).max(c) >= acc.len() {
                continue;
            }
            let pa = glam::Vec3::from(self.positions[a]);
            let face = (glam::Vec3::from(self.positions[b]) - pa)
                .cross(glam::Vec3::from(self.positions[c]) - pa);
            acc[a] += face;
            acc[b] += face;
            acc[c] += face;
        }
        acc.into_iter()
            .map(|n| n.normalize_or_zero().to_array())
            .collect()
    }

    /// Uniformly scale all positions about the local origin
    pub fn scale(&mut self, factor: f32) {
        for p in &mut self.positions {
            p[0] *= factor;
            p[1] *= factor;
            p[2] *= factor;
        }
    }

    /// Translate all positions so that `origin` lands on (0, 0, 0)
    pub fn recenter(&mut self, origin: Vec3) {
        for p in &mut self.positions {
            p[0] -= origin.x;
            p[1] -= origin.y;
            p[2] -= origin.z;
        }
    }
}

/// PBR factors carried through normalization
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialInfo {
    pub name: String,
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
}

impl Default for MaterialInfo {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: [0.8, 0.8, 0.8, 1.0],
            metallic: 0.0,
            roughness: 0.5,
        }
    }
}

impl MaterialInfo {
    /// glTF material object with these factors and no textures
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "pbrMetallicRoughness": {
                "baseColorFactor": self.base_color,
                "metallicFactor": self.metallic,
                "roughnessFactor": self.roughness
            }
        })
    }
}

/// Image payload carried from input to output
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Raw encoded image bytes, written into the GLB binary chunk
    Embedded { bytes: Vec<u8>, mime_type: String },
    /// A `data:` URI kept as-is
    DataUri(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub name: Option<String>,
    pub source: ImageSource,
}

/// Everything a model's surfaces reference besides geometry.
///
/// Material, texture and sampler objects are kept as raw glTF JSON so that
/// extensions and texture bindings survive a rewrite; image indices in
/// `textures` refer to `images` in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialSet {
    pub materials: Vec<Value>,
    pub textures: Vec<Value>,
    pub samplers: Vec<Value>,
    pub images: Vec<ImageData>,
    /// Material and texture extensions named in `extensionsUsed`
    pub extensions_used: Vec<String>,
}

impl MaterialSet {
    /// A single untextured material
    pub fn single(material: &MaterialInfo) -> Self {
        Self {
            materials: vec![material.to_json()],
            ..Default::default()
        }
    }
}

/// One output primitive: geometry plus an index into [`MaterialSet::materials`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfacePart {
    pub mesh: MeshData,
    pub material: Option<usize>,
}

/// A glTF document flattened into world-space triangle primitives
#[derive(Debug, Clone, Default)]
pub struct LoadedModel {
    /// One entry per triangle primitive, already in world space
    pub primitives: Vec<MeshData>,
    /// Material of each primitive (index into `materials`)
    pub primitive_materials: Vec<Option<usize>>,
    pub materials: Vec<MaterialInfo>,
    /// Raw materials, textures and images for rewriting
    pub material_set: MaterialSet,
    /// Scene nodes that reference a mesh
    pub geometry_nodes: usize,
    /// Non-fatal load findings (skipped primitives etc.)
    pub warnings: Vec<String>,
    /// Content a rewrite would lose or corrupt
    pub unsupported: Vec<String>,
}

impl LoadedModel {
    pub fn vertex_count(&self) -> usize {
        self.primitives.iter().map(|p| p.vertex_count()).sum()
    }

    pub fn triangle_count(&self) -> usize {
        self.primitives.iter().map(|p| p.triangle_count()).sum()
    }

    pub fn bounds(&self) -> Option<MeshBounds> {
        self.primitives
            .iter()
            .filter_map(|m| m.bounds())
            .reduce(|a, b| a.union(&b))
    }

    /// Number of distinct materials actually referenced by geometry
    pub fn used_material_count(&self) -> usize {
        let mut used: Vec<usize> = self.primitive_materials.iter().flatten().copied().collect();
        used.sort_unstable();
        used.dedup();
        used.len()
    }

    /// Material of the first primitive that has one
    pub fn primary_material(&self) -> Option<&MaterialInfo> {
        self.primitive_materials
            .iter()
            .flatten()
            .next()
            .and_then(|i| self.materials.get(*i))
    }
}
