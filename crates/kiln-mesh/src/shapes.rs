//! Procedural placeholder geometry

use crate::types::MeshData;
use kiln_core::Vec3;

/// Axis-aligned box centered on the origin with per-face normals and UVs
pub fn box_mesh(size: Vec3) -> MeshData {
    let h = size * 0.5;
    // (normal, u axis, v axis) per face
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];

    let mut mesh = MeshData::default();
    for (n, u, v) in faces {
        let base = mesh.positions.len() as u32;
        for (su, sv) in [(-1.0f32, -1.0f32), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let corner = [
                (n[0] + u[0] * su + v[0] * sv) * h.x,
                (n[1] + u[1] * su + v[1] * sv) * h.y,
                (n[2] + u[2] * su + v[2] * sv) * h.z,
            ];
            mesh.positions.push(corner);
            mesh.normals.push(n);
            mesh.uvs.push([(su + 1.0) * 0.5, (1.0 - sv) * 0.5]);
        }
        mesh.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_dimensions() {
        let mesh = box_mesh(Vec3::new(2.0, 1.0, 1.5));
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.triangle_count(), 12);
        let b = mesh.bounds().unwrap();
        assert_eq!(b.min, [-1.0, -0.5, -0.75]);
        assert_eq!(b.max, [1.0, 0.5, 0.75]);
    }

    #[test]
    fn test_box_faces_wind_outward() {
        let mesh = box_mesh(Vec3::ONE);
        for tri in mesh.indices.chunks(3) {
            let a = glam::Vec3::from(mesh.positions[tri[0] as usize]);
            let b = glam::Vec3::from(mesh.positions[tri[1] as usize]);
            let c = glam::Vec3::from(mesh.positions[tri[2] as usize]);
            let face = (b - a).cross(c - a);
            let n = glam::Vec3::from(mesh.normals[tri[0] as usize]);
            assert!(face.dot(n) > 0.0);
        }
    }
}
