//! Size, pivot and vertex-budget normalization of generated models

use crate::decimate::decimate;
use crate::glb_writer::write_model;
use crate::types::{LoadedModel, MaterialSet, MeshBounds, MeshData, SurfacePart};
use crate::validate::{inspect, validate_mesh, MeshReport};
use kiln_core::{KilnError, Result, Vec3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Constraints applied by [`MeshNormalizer::normalize`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Bounding box the model must fit inside, in meters
    pub target_size: Option<Vec3>,
    /// Normalized (0-1 per axis) point of the bounds that becomes the origin
    pub pivot: Option<Vec3>,
    /// Vertex budget; 0 disables decimation
    pub max_vertex_count: usize,
    /// When false the input is copied through untouched
    pub enabled: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            target_size: None,
            pivot: None,
            max_vertex_count: 10_000,
            enabled: true,
        }
    }
}

/// Audit record of one normalization run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeReport {
    /// Operations in the order they were applied
    pub operations: Vec<String>,
    pub original_vertex_count: usize,
    pub final_vertex_count: usize,
    pub original_bytes: u64,
    pub final_bytes: u64,
    pub scale_factor: Option<f32>,
    /// Point of the pre-pivot bounds that was moved to the origin
    pub pivot_origin: Option<Vec3>,
    /// Validation of the written output
    pub validation: MeshReport,
    /// True when the output is an unmodified copy of the input
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl NormalizeReport {
    pub fn status(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else {
            "applied"
        }
    }
}

/// Uniform scale that fits `current` inside `target`.
///
/// Axes with no extent on either side are ignored. Returns `None` when no
/// axis qualifies.
pub fn uniform_scale_factor(current: [f32; 3], target: Vec3) -> Option<f32> {
    let target = target.to_array();
    (0..3)
        .filter(|&i| current[i] > 0.0 && target[i] > 0.0)
        .map(|i| target[i] / current[i])
        .reduce(f32::min)
}

/// Point inside `bounds` addressed by a normalized pivot
pub fn pivot_origin(bounds: &MeshBounds, pivot: Vec3) -> Vec3 {
    let min = bounds.min_vec();
    min + (bounds.max_vec() - min).mul_elem(&pivot)
}

/// Validates raw model files and rewrites them to meet size constraints.
///
/// Processing is synchronous and CPU-bound; async callers should run it on
/// a blocking worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshNormalizer;

impl MeshNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, path: &Path) -> MeshReport {
        validate_mesh(path)
    }

    /// Normalize `input` into `output`.
    ///
    /// An input that does not validate is an error. A valid input whose
    /// processing fails, or that carries content a rewrite would lose,
    /// degrades to a plain copy recorded as skipped.
    pub fn normalize(
        &self,
        input: &Path,
        output: &Path,
        options: &NormalizeOptions,
    ) -> Result<NormalizeReport> {
        if !options.enabled {
            return fallback_copy(input, output, "normalization disabled".to_string());
        }

        let (original, model) = inspect(input).map_err(|e| {
            KilnError::Normalization(format!("Invalid model {}: {}", input.display(), e))
        })?;

        match process(original, model, output, options) {
            Ok(report) => {
                tracing::info!(
                    input = %input.display(),
                    operations = ?report.operations,
                    vertices = report.final_vertex_count,
                    "Normalized model"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(
                    input = %input.display(),
                    error = %e,
                    "Normalization failed, keeping original model"
                );
                fallback_copy(input, output, e.to_string())
            }
        }
    }
}

fn process(
    original: MeshReport,
    model: LoadedModel,
    output: &Path,
    options: &NormalizeOptions,
) -> Result<NormalizeReport> {
    if !model.unsupported.is_empty() {
        return Err(KilnError::Normalization(format!(
            "Model uses features that cannot be rewritten: {}",
            model.unsupported.join("; ")
        )));
    }

    let mut report = NormalizeReport {
        original_vertex_count: original.vertex_count,
        original_bytes: original.file_size_bytes,
        ..Default::default()
    };

    let mut parts = group_by_material(&model);
    if parts.len() < model.primitives.len() {
        report.operations.push("combine_meshes".into());
    }

    let max = options.max_vertex_count;
    let total: usize = parts.iter().map(|p| p.mesh.vertex_count()).sum();
    if max > 0 && total > max {
        for part in &mut parts {
            // Each part keeps its share of the budget
            let share = (max * part.mesh.vertex_count() / total).max(3);
            part.mesh = decimate(&part.mesh, share);
        }
        let after: usize = parts.iter().map(|p| p.mesh.vertex_count()).sum();
        tracing::debug!(before = total, after, "Decimated model");
        report.operations.push(format!("decimate_{}", max));
    }

    if let Some(target) = options.target_size {
        let size = bounds_of(&parts)?.size();
        if let Some(factor) = uniform_scale_factor(size, target) {
            for part in &mut parts {
                part.mesh.scale(factor);
            }
            report.scale_factor = Some(factor);
            report.operations.push(format!("scale_{:.3}", factor));
        }
    }

    if let Some(pivot) = options.pivot {
        let origin = pivot_origin(&bounds_of(&parts)?, pivot);
        for part in &mut parts {
            part.mesh.recenter(origin);
        }
        report.pivot_origin = Some(origin);
        report
            .operations
            .push(format!("pivot_{}_{}_{}", pivot.x, pivot.y, pivot.z));
    }

    write_atomic(output, &parts, &model.material_set)?;
    report.operations.push("export".into());

    let validation = validate_mesh(output);
    if !validation.valid {
        return Err(KilnError::Normalization(format!(
            "Normalized output failed validation: {}",
            validation.errors.join("; ")
        )));
    }
    report.final_vertex_count = validation.vertex_count;
    report.final_bytes = validation.file_size_bytes;
    report.validation = validation;
    Ok(report)
}

/// Merge primitives sharing a material, in first-appearance order
fn group_by_material(model: &LoadedModel) -> Vec<SurfacePart> {
    let mut groups: Vec<(Option<usize>, Vec<MeshData>)> = Vec::new();
    for (mesh, material) in model.primitives.iter().zip(&model.primitive_materials) {
        match groups.iter_mut().find(|(m, _)| m == material) {
            Some((_, meshes)) => meshes.push(mesh.clone()),
            None => groups.push((*material, vec![mesh.clone()])),
        }
    }
    groups
        .into_iter()
        .map(|(material, meshes)| SurfacePart {
            mesh: MeshData::concatenate(&meshes),
            material,
        })
        .collect()
}

fn bounds_of(parts: &[SurfacePart]) -> Result<MeshBounds> {
    parts
        .iter()
        .filter_map(|p| p.mesh.bounds())
        .reduce(|a, b| a.union(&b))
        .ok_or_else(|| KilnError::Normalization("Mesh has no vertices".into()))
}

fn write_atomic(output: &Path, parts: &[SurfacePart], materials: &MaterialSet) -> Result<()> {
    let tmp = output.with_extension("glb.tmp");
    if let Err(e) = write_model(&tmp, parts, materials) {
        std::fs::remove_file(&tmp).ok();
        return Err(e);
    }
    std::fs::rename(&tmp, output)?;
    Ok(())
}

fn fallback_copy(input: &Path, output: &Path, reason: String) -> Result<NormalizeReport> {
    if input != output {
        std::fs::copy(input, output)?;
    }
    let validation = validate_mesh(output);
    Ok(NormalizeReport {
        operations: vec!["fallback_copy".into()],
        original_vertex_count: validation.vertex_count,
        final_vertex_count: validation.vertex_count,
        original_bytes: validation.file_size_bytes,
        final_bytes: validation.file_size_bytes,
        validation,
        skipped: true,
        skip_reason: Some(reason),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glb_writer::{encode_glb, encode_model, write_glb};
    use crate::load::load_model;
    use crate::shapes::box_mesh;
    use crate::types::{ImageData, ImageSource, MaterialInfo};
    use serde_json::json;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("kiln_normalize_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_box(dir: &Path, name: &str, size: Vec3) -> PathBuf {
        let path = dir.join(name);
        write_glb(&path, &box_mesh(size), &MaterialInfo::default()).unwrap();
        path
    }

    /// Re-encode a single-mesh GLB so the mesh is instanced by several
    /// translated nodes.
    fn write_instanced(path: &Path, mesh: &MeshData, translations: &[[f32; 3]]) {
        let bytes = encode_glb(mesh, &MaterialInfo::default()).unwrap();
        let json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let mut doc: serde_json::Value = serde_json::from_slice(&bytes[20..20 + json_len]).unwrap();
        let bin_chunk = &bytes[20 + json_len..];

        let nodes: Vec<_> = translations
            .iter()
            .map(|t| serde_json::json!({ "mesh": 0, "translation": t }))
            .collect();
        doc["scenes"][0]["nodes"] = (0..nodes.len()).collect::<Vec<_>>().into();
        doc["nodes"] = nodes.into();

        let mut json = serde_json::to_vec(&doc).unwrap();
        json.resize((json.len() + 3) & !3, b' ');
        let total = 12 + 8 + json.len() + bin_chunk.len();

        let mut out = Vec::new();
        out.extend_from_slice(b"glTF");
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&0x4E4F534Au32.to_le_bytes());
        out.extend_from_slice(&json);
        out.extend_from_slice(bin_chunk);
        std::fs::write(path, out).unwrap();
    }

    /// Flat `n x n` vertex grid on the XZ plane
    fn plane(n: u32) -> MeshData {
        let mut mesh = MeshData::default();
        for z in 0..n {
            for x in 0..n {
                mesh.positions.push([x as f32 * 0.1, 0.0, z as f32 * 0.1]);
                mesh.normals.push([0.0, 1.0, 0.0]);
                mesh.uvs.push([x as f32 / (n - 1) as f32, z as f32 / (n - 1) as f32]);
            }
        }
        for z in 0..n - 1 {
            for x in 0..n - 1 {
                let i = z * n + x;
                mesh.indices
                    .extend_from_slice(&[i, i + n, i + 1, i + 1, i + n, i + n + 1]);
            }
        }
        mesh
    }

    /// Two boxes side by side, the first with a base color texture
    fn textured_pair(base_color_texture: serde_json::Value) -> (Vec<SurfacePart>, MaterialSet) {
        let mut offset = box_mesh(Vec3::ONE);
        offset.recenter(Vec3::new(-2.0, 0.0, 0.0));
        let parts = vec![
            SurfacePart { mesh: box_mesh(Vec3::ONE), material: Some(0) },
            SurfacePart { mesh: offset, material: Some(1) },
        ];
        let materials = MaterialSet {
            materials: vec![
                json!({
                    "name": "painted",
                    "pbrMetallicRoughness": { "baseColorTexture": base_color_texture },
                    "extensions": { "KHR_materials_emissive_strength": { "emissiveStrength": 2.0 } }
                }),
                MaterialInfo::default().to_json(),
            ],
            textures: vec![json!({ "source": 0, "sampler": 0 })],
            samplers: vec![json!({ "magFilter": 9729, "minFilter": 9987 })],
            images: vec![ImageData {
                name: Some("albedo".into()),
                source: ImageSource::Embedded {
                    bytes: b"\x89PNG fake texture payload".to_vec(),
                    mime_type: "image/png".into(),
                },
            }],
            extensions_used: vec!["KHR_materials_emissive_strength".into()],
        };
        (parts, materials)
    }

    #[test]
    fn test_uniform_scale_factor() {
        assert_eq!(
            uniform_scale_factor([1.0, 1.0, 1.0], Vec3::new(2.0, 1.0, 1.5)),
            Some(1.0)
        );
        assert_eq!(
            uniform_scale_factor([4.0, 2.0, 2.0], Vec3::ONE),
            Some(0.25)
        );
        // Flat along Y: only X and Z count
        assert_eq!(
            uniform_scale_factor([2.0, 0.0, 4.0], Vec3::new(1.0, 1.0, 1.0)),
            Some(0.25)
        );
        assert_eq!(uniform_scale_factor([0.0, 0.0, 0.0], Vec3::ONE), None);
    }

    #[test]
    fn test_pivot_origin_base_center() {
        let bounds = MeshBounds {
            min: [-1.0, -1.0, -1.0],
            max: [1.0, 1.0, 1.0],
        };
        assert_eq!(
            pivot_origin(&bounds, Vec3::new(0.5, 0.5, 0.0)),
            Vec3::new(0.0, 0.0, -1.0)
        );
    }

    #[test]
    fn test_scale_preserves_proportions() {
        let dir = temp_dir();
        let input = write_box(&dir, "raw.glb", Vec3::ONE);
        let output = dir.join("out.glb");

        let options = NormalizeOptions {
            target_size: Some(Vec3::new(2.0, 1.0, 1.5)),
            ..Default::default()
        };
        let report = MeshNormalizer::new().normalize(&input, &output, &options).unwrap();

        assert!(!report.skipped);
        assert_eq!(report.scale_factor, Some(1.0));
        assert_eq!(report.operations, vec!["scale_1.000", "export"]);
        let size = report.validation.bounds.unwrap().size();
        assert_eq!(size, [1.0, 1.0, 1.0]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_scale_down_and_pivot() {
        let dir = temp_dir();
        let input = write_box(&dir, "raw.glb", Vec3::new(4.0, 2.0, 2.0));
        let output = dir.join("out.glb");

        let options = NormalizeOptions {
            target_size: Some(Vec3::ONE),
            pivot: Some(Vec3::new(0.5, 0.5, 0.0)),
            ..Default::default()
        };
        let report = MeshNormalizer::new().normalize(&input, &output, &options).unwrap();

        assert_eq!(report.scale_factor, Some(0.25));
        assert_eq!(
            report.operations,
            vec!["scale_0.250", "pivot_0.5_0.5_0", "export"]
        );
        let bounds = report.validation.bounds.unwrap();
        assert_eq!(bounds.size(), [1.0, 0.5, 0.5]);
        assert_eq!(bounds.min, [-0.5, -0.25, 0.0]);
        assert_eq!(bounds.max, [0.5, 0.25, 0.5]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_combines_instanced_nodes() {
        let dir = temp_dir();
        let input = dir.join("pair.glb");
        write_instanced(&input, &box_mesh(Vec3::ONE), &[[3.0, 0.0, 0.0], [-3.0, 0.0, 0.0]]);

        let raw = load_model(&input).unwrap();
        assert_eq!(raw.primitives.len(), 2);

        let output = dir.join("out.glb");
        let report = MeshNormalizer::new()
            .normalize(&input, &output, &NormalizeOptions::default())
            .unwrap();

        assert_eq!(report.operations, vec!["combine_meshes", "export"]);
        assert_eq!(report.original_vertex_count, 48);
        assert_eq!(report.final_vertex_count, 48);
        assert_eq!(report.validation.primitive_count, 1);
        assert_eq!(report.validation.bounds.unwrap().size(), [7.0, 1.0, 1.0]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_decimates_over_budget() {
        let dir = temp_dir();
        let input = dir.join("dense.glb");
        // Two instances of a 40x40 grid: 3200 vertices
        write_instanced(&input, &plane(40), &[[0.0, 0.0, 0.0], [5.0, 0.0, 0.0]]);

        let output = dir.join("out.glb");
        let options = NormalizeOptions {
            max_vertex_count: 400,
            ..Default::default()
        };
        let report = MeshNormalizer::new().normalize(&input, &output, &options).unwrap();

        assert!(!report.skipped, "{:?}", report.skip_reason);
        assert_eq!(report.operations[0], "combine_meshes");
        assert_eq!(report.operations[1], "decimate_400");
        assert_eq!(report.original_vertex_count, 3200);
        assert!(report.final_vertex_count <= 400);
        assert!(report.final_vertex_count > 8);
        assert!(report.validation.valid);
        let size = report.validation.bounds.unwrap().size();
        assert!(size[0] > 7.0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let dir = temp_dir();
        let input = dir.join("broken.glb");
        std::fs::write(&input, b"not a model").unwrap();
        let output = dir.join("out.glb");

        let options = NormalizeOptions {
            target_size: Some(Vec3::ONE),
            ..Default::default()
        };
        let err = MeshNormalizer::new()
            .normalize(&input, &output, &options)
            .unwrap_err();

        assert!(matches!(err, KilnError::Normalization(_)));
        assert!(err.to_string().contains("Invalid model"));
        assert!(!output.exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_keeps_textures_and_materials() {
        let dir = temp_dir();
        let input = dir.join("textured.glb");
        let (parts, materials) = textured_pair(json!({ "index": 0 }));
        std::fs::write(&input, encode_model(&parts, &materials).unwrap()).unwrap();
        let output = dir.join("out.glb");

        let options = NormalizeOptions {
            target_size: Some(Vec3::new(2.0, 2.0, 2.0)),
            ..Default::default()
        };
        let report = MeshNormalizer::new().normalize(&input, &output, &options).unwrap();

        assert!(!report.skipped, "{:?}", report.skip_reason);
        assert!(report.scale_factor.is_some());
        assert_eq!(report.validation.primitive_count, 2);
        assert_eq!(report.validation.material_count, 2);

        let gltf = gltf::Gltf::open(&output).unwrap();
        let document = &gltf.document;
        assert_eq!(document.materials().count(), 2);
        assert_eq!(document.textures().count(), 1);
        assert_eq!(document.samplers().count(), 1);
        assert_eq!(document.images().count(), 1);
        assert!(document
            .extensions_used()
            .any(|e| e == "KHR_materials_emissive_strength"));

        let painted = document.materials().next().unwrap();
        assert_eq!(painted.name(), Some("painted"));
        let texture = painted.pbr_metallic_roughness().base_color_texture().unwrap();
        assert_eq!(texture.texture().source().index(), 0);

        let image = document.images().next().unwrap();
        assert_eq!(image.name(), Some("albedo"));
        let gltf::image::Source::View { view, mime_type } = image.source() else {
            panic!("expected an embedded image");
        };
        assert_eq!(mime_type, "image/png");
        let blob = gltf.blob.as_ref().unwrap();
        assert_eq!(
            &blob[view.offset()..view.offset() + view.length()],
            b"\x89PNG fake texture payload"
        );

        let primitives: Vec<_> = document.meshes().next().unwrap().primitives().collect();
        assert_eq!(primitives.len(), 2);
        assert_eq!(primitives[0].material().index(), Some(0));
        assert_eq!(primitives[1].material().index(), Some(1));
        assert!(primitives[0]
            .attributes()
            .any(|(semantic, _)| semantic == gltf::Semantic::TexCoords(0)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_secondary_uv_material_falls_back_to_copy() {
        let dir = temp_dir();
        let input = dir.join("uv1.glb");
        let (parts, materials) = textured_pair(json!({ "index": 0, "texCoord": 1 }));
        std::fs::write(&input, encode_model(&parts, &materials).unwrap()).unwrap();
        let output = dir.join("out.glb");

        let options = NormalizeOptions {
            target_size: Some(Vec3::ONE),
            ..Default::default()
        };
        let report = MeshNormalizer::new().normalize(&input, &output, &options).unwrap();

        assert!(report.skipped);
        assert_eq!(report.status(), "skipped");
        assert_eq!(report.operations, vec!["fallback_copy"]);
        assert!(report.skip_reason.unwrap().contains("secondary UV set"));
        assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&input).unwrap());
        assert!(report.validation.valid);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_disabled_copies_through() {
        let dir = temp_dir();
        let input = write_box(&dir, "raw.glb", Vec3::new(5.0, 5.0, 5.0));
        let output = dir.join("out.glb");

        let options = NormalizeOptions {
            target_size: Some(Vec3::ONE),
            enabled: false,
            ..Default::default()
        };
        let report = MeshNormalizer::new().normalize(&input, &output, &options).unwrap();

        assert!(report.skipped);
        assert_eq!(report.skip_reason.as_deref(), Some("normalization disabled"));
        assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&input).unwrap());
        assert!(report.validation.valid);

        std::fs::remove_dir_all(&dir).ok();
    }
}
