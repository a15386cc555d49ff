//! Pose math shared by the solver and the wire codecs.
//!
//! Two coordinate conventions meet here:
//!
//! - CV camera frame: +x right, +y down, +z out of the lens. Rotations are
//!   Rodrigues vectors (axis scaled by angle).
//! - Field frame: +x forward, +y left, +z up.
//!
//! The permutation between them is fixed:
//! `(field_x, field_y, field_z) = (cv_z, -cv_x, -cv_y)` for translations and
//! for rotation-axis components; the rotation angle is the Euclidean norm of
//! the Rodrigues vector either way.

use nalgebra::{Isometry3, Point2, Quaternion, Translation3, UnitQuaternion, Vector3};

use crate::config::CameraCalibration;

/// Convert a CV-frame pose (Rodrigues rotation + translation) into a
/// field-convention isometry.
pub fn cv_pose_to_field(rvec: &Vector3<f64>, tvec: &Vector3<f64>) -> Isometry3<f64> {
    let translation = Vector3::new(tvec.z, -tvec.x, -tvec.y);
    let axis = Vector3::new(rvec.z, -rvec.x, -rvec.y);
    Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_scaled_axis(axis),
    )
}

/// Translation-only inverse of the frame permutation: field -> CV.
pub fn field_to_cv_translation(t: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(-t.y, -t.z, t.x)
}

/// Build a unit quaternion from scalar-first components.
pub fn quaternion_from_wxyz(w: f64, x: f64, y: f64, z: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
}

/// Scalar-first quaternion components of a pose's rotation.
pub fn quaternion_wxyz(pose: &Isometry3<f64>) -> [f64; 4] {
    let q = pose.rotation;
    [q.w, q.i, q.j, q.k]
}

/// Pinhole projection of CV-frame object points through `rvec`/`tvec`.
///
/// Distortion coefficients are not applied; reprojection errors computed
/// against undistorted observations are exact, against raw observations they
/// are an approximation that preserves candidate ordering.
pub fn project_points(
    calibration: &CameraCalibration,
    rvec: &Vector3<f64>,
    tvec: &Vector3<f64>,
    object_points: &[Vector3<f64>],
) -> Vec<Point2<f64>> {
    let rotation = UnitQuaternion::from_scaled_axis(*rvec);
    let m = &calibration.matrix;
    let (fx, fy, cx, cy) = (m[(0, 0)], m[(1, 1)], m[(0, 2)], m[(1, 2)]);
    object_points
        .iter()
        .map(|p| {
            let cam = rotation * p + tvec;
            let z = if cam.z.abs() < 1e-9 { 1e-9 } else { cam.z };
            Point2::new(fx * cam.x / z + cx, fy * cam.y / z + cy)
        })
        .collect()
}

/// Root-mean-square pixel distance between projected and observed corners.
pub fn reprojection_rms(projected: &[Point2<f64>], observed: &[Point2<f64>]) -> f64 {
    if projected.is_empty() || projected.len() != observed.len() {
        return f64::MAX;
    }
    let sum_sq: f64 = projected
        .iter()
        .zip(observed)
        .map(|(p, o)| {
            let dx = p.x - o.x;
            let dy = p.y - o.y;
            dx * dx + dy * dy
        })
        .sum();
    (sum_sq / projected.len() as f64).sqrt()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
