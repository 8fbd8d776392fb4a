//! glTF/GLB loading into world-space geometry

use crate::types::{ImageData, ImageSource, LoadedModel, MaterialInfo, MaterialSet, MeshData};
use glam::{Mat3, Mat4, Vec3 as GVec3};
use gltf::mesh::Semantic;
use kiln_core::{KilnError, Result};
use serde_json::Value;
use std::path::Path;

/// Extension prefixes that only touch materials and textures
const SURFACE_EXTENSIONS: &[&str] = &["KHR_materials_", "KHR_texture_", "EXT_texture_"];

/// Load a glTF or GLB file, baking node transforms into vertex data.
///
/// Textures are not decoded. Image payloads and material JSON are kept so a
/// rewrite can carry them over; anything a rewrite would drop is listed in
/// [`LoadedModel::unsupported`].
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<LoadedModel> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| KilnError::Import(format!("Cannot read {}: {}", path.display(), e)))?;
    let gltf = gltf::Gltf::from_slice(&bytes)
        .map_err(|e| KilnError::Import(format!("Failed to parse {}: {}", path.display(), e)))?;
    let raw = raw_json(&bytes)?;

    let gltf::Gltf { document, blob } = gltf;
    let buffers = gltf::import_buffers(&document, path.parent(), blob)
        .map_err(|e| KilnError::Import(format!("Failed to load buffers: {}", e)))?;

    let materials = document
        .materials()
        .map(|material| {
            let pbr = material.pbr_metallic_roughness();
            MaterialInfo {
                name: material
                    .name()
                    .map(String::from)
                    .unwrap_or_else(|| format!("material_{}", material.index().unwrap_or(0))),
                base_color: pbr.base_color_factor(),
                metallic: pbr.metallic_factor(),
                roughness: pbr.roughness_factor(),
            }
        })
        .collect();

    let mut model = LoadedModel {
        materials,
        ..Default::default()
    };
    read_surfaces(&document, &raw, &buffers, path, &mut model);

    if document.skins().next().is_some() {
        model.unsupported.push("skins".into());
    }
    if document.animations().next().is_some() {
        model.unsupported.push("animations".into());
    }
    for extension in document.extensions_required() {
        model
            .unsupported
            .push(format!("required extension {}", extension));
    }

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next());

    match scene {
        Some(scene) => {
            for node in scene.nodes() {
                visit_node(&node, Mat4::IDENTITY, &buffers, &mut model);
            }
        }
        None => {
            // No scene graph: take meshes as-is
            for mesh in document.meshes() {
                model.geometry_nodes += 1;
                read_mesh(&mesh, Mat4::IDENTITY, &buffers, &mut model);
            }
        }
    }

    Ok(model)
}

/// The document JSON, from the GLB JSON chunk or the whole file
fn raw_json(bytes: &[u8]) -> Result<Value> {
    let json = if bytes.starts_with(b"glTF") {
        gltf::Glb::from_slice(bytes)
            .map_err(|e| KilnError::Import(format!("Bad GLB container: {}", e)))?
            .json
            .into_owned()
    } else {
        bytes.to_vec()
    };
    Ok(serde_json::from_slice(&json)?)
}

fn raw_array(raw: &Value, key: &str) -> Vec<Value> {
    raw.get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Capture materials, textures and images, noting what cannot be carried
fn read_surfaces(
    document: &gltf::Document,
    raw: &Value,
    buffers: &[gltf::buffer::Data],
    path: &Path,
    model: &mut LoadedModel,
) {
    for material in document.materials() {
        let pbr = material.pbr_metallic_roughness();
        let tex_coords = [
            pbr.base_color_texture().map(|t| t.tex_coord()),
            pbr.metallic_roughness_texture().map(|t| t.tex_coord()),
            material.normal_texture().map(|t| t.tex_coord()),
            material.occlusion_texture().map(|t| t.tex_coord()),
            material.emissive_texture().map(|t| t.tex_coord()),
        ];
        if tex_coords.iter().flatten().any(|&set| set != 0) {
            model.unsupported.push(format!(
                "material {} samples a secondary UV set",
                material.index().unwrap_or(0)
            ));
        }
    }

    let mut images = Vec::new();
    for image in document.images() {
        let name = image.name().map(String::from);
        let source = match image.source() {
            gltf::image::Source::View { view, mime_type } => buffers
                .get(view.buffer().index())
                .and_then(|data| data.get(view.offset()..view.offset() + view.length()))
                .map(|bytes| ImageSource::Embedded {
                    bytes: bytes.to_vec(),
                    mime_type: mime_type.to_string(),
                }),
            gltf::image::Source::Uri { uri, .. } if uri.starts_with("data:") => {
                Some(ImageSource::DataUri(uri.to_string()))
            }
            gltf::image::Source::Uri { uri, mime_type } => external_image(path, uri, mime_type),
        };
        match source {
            Some(source) => images.push(ImageData { name, source }),
            None => model
                .unsupported
                .push(format!("image {} could not be embedded", image.index())),
        }
    }

    model.material_set = MaterialSet {
        materials: raw_array(raw, "materials"),
        textures: raw_array(raw, "textures"),
        samplers: raw_array(raw, "samplers"),
        images,
        extensions_used: document
            .extensions_used()
            .filter(|name| SURFACE_EXTENSIONS.iter().any(|p| name.starts_with(p)))
            .map(String::from)
            .collect(),
    };
}

/// Read an image stored next to the model so it can be embedded
fn external_image(path: &Path, uri: &str, mime_type: Option<&str>) -> Option<ImageSource> {
    let file = path.parent().unwrap_or(Path::new(".")).join(uri);
    let mime_type = match mime_type {
        Some(m) => m.to_string(),
        None => {
            let ext = file.extension()?.to_str()?.to_ascii_lowercase();
            let guessed = match ext.as_str() {
                "png" => "image/png",
                "jpg" | "jpeg" => "image/jpeg",
                "webp" => "image/webp",
                "ktx2" => "image/ktx2",
                _ => return None,
            };
            guessed.to_string()
        }
    };
    let bytes = std::fs::read(&file).ok()?;
    Some(ImageSource::Embedded { bytes, mime_type })
}

fn visit_node(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    model: &mut LoadedModel,
) {
    let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        model.geometry_nodes += 1;
        read_mesh(&mesh, world, buffers, model);
    }

    for child in node.children() {
        visit_node(&child, world, buffers, model);
    }
}

fn read_mesh(
    mesh: &gltf::Mesh,
    world: Mat4,
    buffers: &[gltf::buffer::Data],
    model: &mut LoadedModel,
) {
    let normal_matrix = Mat3::from_mat4(world).inverse().transpose();
    let mirrored = world.determinant() < 0.0;

    for primitive in mesh.primitives() {
        let label = format!("primitive {} of mesh {}", primitive.index(), mesh.index());

        if primitive.mode() != gltf::mesh::Mode::Triangles {
            model.warnings.push(format!("Skipped non-triangle {}", label));
            model.unsupported.push(format!("non-triangle {}", label));
            continue;
        }

        for (semantic, _) in primitive.attributes() {
            let dropped = match semantic {
                Semantic::Colors(_) => Some("vertex colors"),
                Semantic::TexCoords(set) if set > 0 => Some("secondary UV set"),
                Semantic::Joints(_) | Semantic::Weights(_) => Some("skinning attributes"),
                _ => None,
            };
            if let Some(what) = dropped {
                model.unsupported.push(format!("{} on {}", what, label));
            }
        }
        if primitive.morph_targets().next().is_some() {
            model.unsupported.push(format!("morph targets on {}", label));
        }

        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| &d[..]));

        let positions: Vec<[f32; 3]> = match reader.read_positions() {
            Some(iter) => iter
                .map(|p| world.transform_point3(GVec3::from(p)).to_array())
                .collect(),
            None => {
                model.warnings.push(format!("Skipped {} without positions", label));
                model.unsupported.push(format!("{} without positions", label));
                continue;
            }
        };

        let mut normals: Vec<[f32; 3]> = reader
            .read_normals()
            .map(|iter| {
                iter.map(|n| (normal_matrix * GVec3::from(n)).normalize_or_zero().to_array())
                    .collect()
            })
            .unwrap_or_default();
        if normals.len() != positions.len() {
            normals.clear();
        }

        let mut uvs: Vec<[f32; 2]> = reader
            .read_tex_coords(0)
            .map(|iter| iter.into_f32().collect())
            .unwrap_or_default();
        if uvs.len() != positions.len() {
            uvs.clear();
        }

        let mut indices: Vec<u32> = reader
            .read_indices()
            .map(|iter| iter.into_u32().collect())
            .unwrap_or_else(|| (0..positions.len() as u32).collect());
        indices.truncate(indices.len() - indices.len() % 3);

        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            model.warnings.push(format!(
                "Skipped {}: index {} out of range for {} vertices",
                label,
                bad,
                positions.len()
            ));
            model.unsupported.push(format!("out-of-range indices in {}", label));
            continue;
        }

        if mirrored {
            for tri in indices.chunks_exact_mut(3) {
                tri.swap(1, 2);
            }
        }

        model.primitive_materials.push(primitive.material().index());
        model.primitives.push(MeshData {
            positions,
            normals,
            uvs,
            indices,
        });
    }
}
