//! Deterministic pinhole-approximation PnP backend.
//!
//! Range comes from the apparent corner scale, bearing from the pixel
//! centroid ray, and rotation from the trapezoid asymmetry of the observed
//! corners. Reprojection errors are real RMS residuals computed through the
//! shared pinhole projection, so candidate ordering is meaningful. Real
//! solver libraries plug in behind the same `PnpBackend` trait.

use anyhow::{bail, Result};
use nalgebra::{Point2, UnitQuaternion, Vector3};

use crate::config::CameraCalibration;
use crate::geom;

use super::{PnpBackend, PnpSolution};

const MIN_PIXEL_SPREAD: f64 = 1e-6;

pub struct PinholeBackend;

impl PnpBackend for PinholeBackend {
    fn solve_planar_square(
        &self,
        calibration: &CameraCalibration,
        object: &[Vector3<f64>; 4],
        observed: &[Point2<f64>; 4],
    ) -> Result<[PnpSolution; 2]> {
        check_finite(observed.as_slice())?;
        let side = (object[1] - object[0]).norm();
        let edge_mean = mean_edge_length(observed);
        if side <= MIN_PIXEL_SPREAD || edge_mean <= MIN_PIXEL_SPREAD {
            bail!("degenerate corner geometry");
        }

        let m = &calibration.matrix;
        let (fx, fy, cx, cy) = (m[(0, 0)], m[(1, 1)], m[(0, 2)], m[(1, 2)]);
        let range = fx * side / edge_mean;
        let centroid = pixel_centroid(observed.as_slice());
        let ray = Vector3::new((centroid.x - cx) / fx, (centroid.y - cy) / fy, 1.0);
        let tvec = ray * range;

        // A fronto-parallel tag faces the camera: pi about x maps the
        // tag-local plane onto the image orientation.
        let facing = UnitQuaternion::from_scaled_axis(Vector3::new(std::f64::consts::PI, 0.0, 0.0));
        let tilt = tilt_from_trapezoid(observed);

        let make = |sign: f64| -> PnpSolution {
            let rotation = UnitQuaternion::from_scaled_axis(tilt * sign) * facing;
            let rvec = rotation.scaled_axis();
            let projected = geom::project_points(calibration, &rvec, &tvec, object.as_slice());
            PnpSolution {
                rvec,
                tvec,
                reprojection_error: geom::reprojection_rms(&projected, observed.as_slice()),
            }
        };
        let mut a = make(1.0);
        let mut b = make(-1.0);
        if b.reprojection_error < a.reprojection_error {
            std::mem::swap(&mut a, &mut b);
        }
        Ok([a, b])
    }

    fn solve_general(
        &self,
        calibration: &CameraCalibration,
        object: &[Vector3<f64>],
        observed: &[Point2<f64>],
    ) -> Result<PnpSolution> {
        if object.len() != observed.len() || object.len() < 4 {
            bail!(
                "general solve needs at least 4 matched corners, got {}/{}",
                object.len(),
                observed.len()
            );
        }
        check_finite(observed)?;

        let object_centroid: Vector3<f64> =
            object.iter().sum::<Vector3<f64>>() / object.len() as f64;
        let object_spread = rms_spread(object, &object_centroid);
        let pixel_center = pixel_centroid(observed);
        let pixel_spread = observed
            .iter()
            .map(|p| {
                let dx = p.x - pixel_center.x;
                let dy = p.y - pixel_center.y;
                dx * dx + dy * dy
            })
            .sum::<f64>()
            .sqrt()
            / (observed.len() as f64).sqrt();
        if object_spread <= MIN_PIXEL_SPREAD || pixel_spread <= MIN_PIXEL_SPREAD {
            bail!("degenerate corner geometry");
        }

        let m = &calibration.matrix;
        let (fx, fy, cx, cy) = (m[(0, 0)], m[(1, 1)], m[(0, 2)], m[(1, 2)]);
        let range = fx * object_spread / pixel_spread;
        let ray = Vector3::new((pixel_center.x - cx) / fx, (pixel_center.y - cy) / fy, 1.0);

        let rvec = Vector3::zeros();
        let tvec = ray * range - object_centroid;
        let projected = geom::project_points(calibration, &rvec, &tvec, object);
        Ok(PnpSolution {
            rvec,
            tvec,
            reprojection_error: geom::reprojection_rms(&projected, observed),
        })
    }
}

fn check_finite(points: &[Point2<f64>]) -> Result<()> {
    if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
        bail!("non-finite corner coordinates");
    }
    Ok(())
}

fn pixel_centroid(points: &[Point2<f64>]) -> Point2<f64> {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point2::new(sx / n, sy / n)
}

fn mean_edge_length(corners: &[Point2<f64>; 4]) -> f64 {
    let mut total = 0.0;
    for i in 0..4 {
        total += (corners[(i + 1) % 4] - corners[i]).norm();
    }
    total / 4.0
}

fn rms_spread(points: &[Vector3<f64>], centroid: &Vector3<f64>) -> f64 {
    let sum: f64 = points.iter().map(|p| (p - centroid).norm_squared()).sum();
    (sum / points.len() as f64).sqrt()
}

/// In-plane tilt estimated from opposing-edge length asymmetry. A square
/// viewed head-on has zero tilt; the two ambiguous candidates mirror it.
fn tilt_from_trapezoid(corners: &[Point2<f64>; 4]) -> Vector3<f64> {
    let top = (corners[1] - corners[0]).norm();
    let bottom = (corners[2] - corners[3]).norm();
    let left = (corners[3] - corners[0]).norm();
    let right = (corners[2] - corners[1]).norm();

    let tilt_x = ratio_angle(bottom, top);
    let tilt_y = ratio_angle(left, right);
    Vector3::new(tilt_x, tilt_y, 0.0)
}

fn ratio_angle(a: f64, b: f64) -> f64 {
    let total = a + b;
    if total <= MIN_PIXEL_SPREAD {
        return 0.0;
    }
    ((a - b) / total).clamp(-1.0, 1.0).asin()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    fn calibration() -> CameraCalibration {
        CameraCalibration {
            resolution: [640, 480],
            matrix: Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0),
            distortion: vec![0.0; 5],
        }
    }

    fn planar_object(side: f64) -> [Vector3<f64>; 4] {
        let h = side / 2.0;
        [
            Vector3::new(-h, h, 0.0),
            Vector3::new(h, h, 0.0),
            Vector3::new(h, -h, 0.0),
            Vector3::new(-h, -h, 0.0),
        ]
    }

    fn centered_square(half: f64) -> [Point2<f64>; 4] {
        [
            Point2::new(320.0 - half, 240.0 - half),
            Point2::new(320.0 + half, 240.0 - half),
            Point2::new(320.0 + half, 240.0 + half),
            Point2::new(320.0 - half, 240.0 + half),
        ]
    }

    #[test]
    fn range_scales_with_apparent_size() {
        let object = planar_object(0.2);
        let near = PinholeBackend
            .solve_planar_square(&calibration(), &object, &centered_square(50.0))
            .unwrap();
        let far = PinholeBackend
            .solve_planar_square(&calibration(), &object, &centered_square(25.0))
            .unwrap();
        assert!(far[0].tvec.z > near[0].tvec.z);
    }

    #[test]
    fn candidates_are_ordered_by_error() {
        let object = planar_object(0.2);
        let mut observed = centered_square(40.0);
        observed[0].x += 6.0;
        observed[1].x -= 6.0;
        let [a, b] = PinholeBackend
            .solve_planar_square(&calibration(), &object, &observed)
            .unwrap();
        assert!(a.reprojection_error <= b.reprojection_error);
        assert!(a.reprojection_error.is_finite());
    }

    #[test]
    fn degenerate_corners_are_rejected() {
        let object = planar_object(0.2);
        let collapsed = [Point2::new(10.0, 10.0); 4];
        assert!(PinholeBackend
            .solve_planar_square(&calibration(), &object, &collapsed)
            .is_err());

        let nan = [
            Point2::new(f64::NAN, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        assert!(PinholeBackend
            .solve_planar_square(&calibration(), &object, &nan)
            .is_err());
    }

    #[test]
    fn general_solve_rejects_short_inputs() {
        let object = vec![Vector3::zeros(); 3];
        let observed = vec![Point2::new(0.0, 0.0); 3];
        assert!(PinholeBackend
            .solve_general(&calibration(), &object, &observed)
            .is_err());
    }

    #[test]
    fn general_solve_produces_finite_solution() {
        let object: Vec<Vector3<f64>> = planar_object(0.2)
            .iter()
            .map(|p| p + Vector3::new(0.0, 0.0, 3.0))
            .collect();
        let observed: Vec<Point2<f64>> = centered_square(30.0).to_vec();
        let solution = PinholeBackend
            .solve_general(&calibration(), &object, &observed)
            .unwrap();
        assert!(solution.tvec.iter().all(|v| v.is_finite()));
        assert!(solution.reprojection_error.is_finite());
    }
}
