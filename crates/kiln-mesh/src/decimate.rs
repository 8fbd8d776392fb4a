//! Vertex-budget decimation on top of meshoptimizer

use crate::types::MeshData;
use meshopt::{SimplifyOptions, VertexDataAdapter};

/// Simplification rounds before settling for the closest result
const MAX_PASSES: usize = 4;

/// Relative error bound handed to meshoptimizer; the budget is what limits
/// simplification, not the error.
const TARGET_ERROR: f32 = 1.0;

#[derive(Debug, Clone, Copy, Default)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

/// Reduce a mesh to at most `max_vertices` vertices.
///
/// Runs an edge-collapse simplification towards an index count scaled by
/// the budget ratio, switching to sloppy simplification when topology
/// blocks the target, then drops unreferenced vertices. Meshes already
/// within budget are returned unchanged. Triangles referencing vertices
/// that do not exist are discarded first.
pub fn decimate(mesh: &MeshData, max_vertices: usize) -> MeshData {
    if max_vertices == 0 || mesh.vertex_count() <= max_vertices {
        return mesh.clone();
    }

    let indices = valid_triangles(mesh);
    let vertices = interleave(mesh);
    let adapter = match VertexDataAdapter::new(
        meshopt::typed_to_bytes(&mesh.positions),
        std::mem::size_of::<[f32; 3]>(),
        0,
    ) {
        Ok(adapter) => adapter,
        Err(e) => {
            tracing::warn!(error = ?e, "Cannot read vertex positions, skipping decimation");
            return compact(mesh, &vertices, indices);
        }
    };

    let mut best = compact(mesh, &vertices, indices.clone());
    let mut ratio = max_vertices as f32 / mesh.vertex_count() as f32;
    for _ in 0..MAX_PASSES {
        let target = target_index_count(indices.len(), ratio);
        let mut simplified = meshopt::simplify(
            &indices,
            &adapter,
            target,
            TARGET_ERROR,
            SimplifyOptions::None,
            None,
        );
        if referenced_count(&simplified, mesh.vertex_count()) > max_vertices {
            simplified = meshopt::simplify_sloppy(&indices, &adapter, target, TARGET_ERROR, None);
        }
        if simplified.is_empty() {
            break;
        }

        let candidate = compact(mesh, &vertices, simplified);
        if candidate.vertex_count() <= max_vertices {
            return candidate;
        }
        ratio *= max_vertices as f32 / candidate.vertex_count() as f32;
        best = candidate;
    }

    tracing::warn!(
        budget = max_vertices,
        vertices = best.vertex_count(),
        "Decimation could not reach the vertex budget"
    );
    best
}

fn target_index_count(index_count: usize, ratio: f32) -> usize {
    let target = (index_count as f32 * ratio) as usize;
    (target / 3 * 3).max(3)
}

/// Index list without triangles that point past the vertex array
fn valid_triangles(mesh: &MeshData) -> Vec<u32> {
    let count = mesh.vertex_count();
    mesh.indices
        .chunks_exact(3)
        .filter(|tri| tri.iter().all(|&i| (i as usize) < count))
        .flatten()
        .copied()
        .collect()
}

fn referenced_count(indices: &[u32], vertex_count: usize) -> usize {
    let mut seen = vec![false; vertex_count];
    indices
        .iter()
        .filter(|&&i| !std::mem::replace(&mut seen[i as usize], true))
        .count()
}

fn interleave(mesh: &MeshData) -> Vec<Vertex> {
    let normals = mesh.has_normals();
    let uvs = mesh.has_uvs();
    (0..mesh.vertex_count())
        .map(|i| Vertex {
            position: mesh.positions[i],
            normal: if normals { mesh.normals[i] } else { [0.0; 3] },
            uv: if uvs { mesh.uvs[i] } else { [0.0; 2] },
        })
        .collect()
}

/// Keep only the vertices `indices` references, in first-use order
fn compact(mesh: &MeshData, vertices: &[Vertex], mut indices: Vec<u32>) -> MeshData {
    let packed = meshopt::optimize_vertex_fetch(&mut indices, vertices);
    MeshData {
        positions: packed.iter().map(|v| v.position).collect(),
        normals: if mesh.has_normals() {
            packed.iter().map(|v| v.normal).collect()
        } else {
            Vec::new()
        },
        uvs: if mesh.has_uvs() {
            packed.iter().map(|v| v.uv).collect()
        } else {
            Vec::new()
        },
        indices,
    }
}
