//! GLB encoder for flattened models

use crate::types::{ImageSource, MaterialInfo, MaterialSet, MeshData, SurfacePart};
use kiln_core::{KilnError, Result};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::Path;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F534A;
const CHUNK_BIN: u32 = 0x004E4942;

const COMPONENT_FLOAT: u32 = 5126;
const COMPONENT_UINT: u32 = 5125;
const TARGET_ARRAY_BUFFER: u32 = 34962;
const TARGET_ELEMENT_ARRAY_BUFFER: u32 = 34963;

/// Binary chunk under construction plus the views and accessors into it
#[derive(Default)]
struct BinBuilder {
    bin: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
}

impl BinBuilder {
    fn view(&mut self, bytes: &[u8], target: Option<u32>) -> usize {
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytes);
        let mut view = json!({ "buffer": 0, "byteOffset": offset, "byteLength": bytes.len() });
        if let Some(target) = target {
            view["target"] = json!(target);
        }
        self.views.push(view);
        // Keep every view 4-byte aligned
        self.bin.resize((self.bin.len() + 3) & !3, 0);
        self.views.len() - 1
    }

    fn floats<const N: usize>(&mut self, data: &[[f32; N]], kind: &str) -> usize {
        let bytes: Vec<u8> = data.iter().flatten().flat_map(|c| c.to_le_bytes()).collect();
        let view = self.view(&bytes, Some(TARGET_ARRAY_BUFFER));
        self.accessors.push(json!({
            "bufferView": view,
            "componentType": COMPONENT_FLOAT,
            "count": data.len(),
            "type": kind,
        }));
        self.accessors.len() - 1
    }

    fn primitive(&mut self, part: &SurfacePart) -> Result<Value> {
        let mesh = &part.mesh;
        let bounds = mesh.bounds().ok_or_else(|| {
            KilnError::Normalization("Cannot export a mesh with no vertices".into())
        })?;

        let mut attributes = Map::new();
        let position = self.floats(&mesh.positions, "VEC3");
        self.accessors[position]["min"] = json!(bounds.min);
        self.accessors[position]["max"] = json!(bounds.max);
        attributes.insert("POSITION".into(), json!(position));
        if mesh.has_normals() {
            attributes.insert("NORMAL".into(), json!(self.floats(&mesh.normals, "VEC3")));
        }
        if mesh.has_uvs() {
            attributes.insert("TEXCOORD_0".into(), json!(self.floats(&mesh.uvs, "VEC2")));
        }

        let bytes: Vec<u8> = mesh.indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        let view = self.view(&bytes, Some(TARGET_ELEMENT_ARRAY_BUFFER));
        self.accessors.push(json!({
            "bufferView": view,
            "componentType": COMPONENT_UINT,
            "count": mesh.indices.len(),
            "type": "SCALAR",
        }));

        let mut primitive = json!({
            "attributes": attributes,
            "indices": self.accessors.len() - 1,
            "mode": 4
        });
        if let Some(material) = part.material {
            primitive["material"] = json!(material);
        }
        Ok(primitive)
    }
}

/// Encode a mesh as a self-contained GLB with one node, one primitive and
/// one material.
pub fn encode_glb(mesh: &MeshData, material: &MaterialInfo) -> Result<Vec<u8>> {
    let part = SurfacePart {
        mesh: mesh.clone(),
        material: Some(0),
    };
    encode_model(std::slice::from_ref(&part), &MaterialSet::single(material))
}

/// Encode surface parts as one node holding one mesh with a primitive per
/// part. Images are embedded into the binary chunk; material, texture and
/// sampler objects are written unchanged.
pub fn encode_model(parts: &[SurfacePart], materials: &MaterialSet) -> Result<Vec<u8>> {
    if parts.is_empty() {
        return Err(KilnError::Normalization("Cannot export a model with no geometry".into()));
    }

    let mut builder = BinBuilder::default();
    let primitives = parts
        .iter()
        .map(|part| builder.primitive(part))
        .collect::<Result<Vec<_>>>()?;

    let images: Vec<Value> = materials
        .images
        .iter()
        .map(|image| {
            let mut value = match &image.source {
                ImageSource::Embedded { bytes, mime_type } => {
                    json!({ "bufferView": builder.view(bytes, None), "mimeType": mime_type })
                }
                ImageSource::DataUri(uri) => json!({ "uri": uri }),
            };
            if let Some(name) = &image.name {
                value["name"] = json!(name);
            }
            value
        })
        .collect();

    let mut document = json!({
        "asset": { "version": "2.0", "generator": "kiln" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{ "primitives": primitives }],
        "accessors": builder.accessors,
        "bufferViews": builder.views,
        "buffers": [{ "byteLength": builder.bin.len() }]
    });
    // glTF forbids empty top-level arrays
    let optional = [
        ("materials", Value::from(materials.materials.clone())),
        ("textures", Value::from(materials.textures.clone())),
        ("samplers", Value::from(materials.samplers.clone())),
        ("images", Value::from(images)),
        ("extensionsUsed", Value::from(materials.extensions_used.clone())),
    ];
    for (key, value) in optional {
        if value.as_array().is_some_and(|a| !a.is_empty()) {
            document[key] = value;
        }
    }

    let mut bin = builder.bin;
    let json_str = serde_json::to_string(&document)?;

    // JSON chunk pads with spaces, BIN chunk with zeros
    let mut json_padded = json_str.into_bytes();
    let json_len = (json_padded.len() + 3) & !3;
    json_padded.resize(json_len, b' ');
    let bin_len = (bin.len() + 3) & !3;
    bin.resize(bin_len, 0);

    let total_len = 12 + 8 + json_padded.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(GLB_MAGIC);
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total_len as u32).to_le_bytes());

    out.extend_from_slice(&(json_padded.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_padded);

    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);

    Ok(out)
}

/// Encode and write a GLB file
pub fn write_glb(path: &Path, mesh: &MeshData, material: &MaterialInfo) -> Result<()> {
    let bytes = encode_glb(mesh, material)?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

/// Encode and write a multi-part GLB file
pub fn write_model(path: &Path, parts: &[SurfacePart], materials: &MaterialSet) -> Result<()> {
    let bytes = encode_model(parts, materials)?;
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}
