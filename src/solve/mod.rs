//! Pose estimation from tag detections.
//!
//! `PoseEstimator::solve` is a pure function of the calibration, the
//! detections, and the tag environment. The raw perspective computation is
//! an external capability behind `PnpBackend`; the in-tree `PinholeBackend`
//! is a deterministic approximation sufficient for the default build.
//!
//! A single square tag is inherently ambiguous: the backend returns two
//! candidate poses with reprojection errors, and the pair is ordered so the
//! lower-error candidate comes first. Two or more tags pin the solution down
//! to one candidate.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use nalgebra::{Isometry3, Point2, Point3, Vector3};

use crate::config::CameraCalibration;
use crate::detect::TagObservation;
use crate::environment::TagEnvironment;
use crate::geom;

mod pinhole;

pub use pinhole::PinholeBackend;

/// One field-to-camera pose plus the residual that produced it.
#[derive(Clone, Debug)]
pub struct PoseEstimate {
    pub pose: Isometry3<f64>,
    pub reprojection_error: f64,
}

/// Solver output. `pose_b` is present only in the single-tag ambiguous case,
/// and `pose_a.reprojection_error <= pose_b.reprojection_error` always holds.
#[derive(Clone, Debug)]
pub struct EstimatePair {
    pub pose_a: PoseEstimate,
    pub pose_b: Option<PoseEstimate>,
}

/// Raw solver output in the CV camera frame: Rodrigues rotation, translation,
/// and the RMS pixel residual.
#[derive(Clone, Debug)]
pub struct PnpSolution {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
    pub reprojection_error: f64,
}

/// The external perspective-n-point capability.
pub trait PnpBackend: Send + Sync {
    /// Solve a planar square target in tag-local space. Returns the two
    /// ambiguous candidates ordered by increasing reprojection error.
    fn solve_planar_square(
        &self,
        calibration: &CameraCalibration,
        object: &[Vector3<f64>; 4],
        observed: &[Point2<f64>; 4],
    ) -> Result<[PnpSolution; 2]>;

    /// Solve over arbitrarily many corners with known positions. One
    /// solution, no ambiguity.
    fn solve_general(
        &self,
        calibration: &CameraCalibration,
        object: &[Vector3<f64>],
        observed: &[Point2<f64>],
    ) -> Result<PnpSolution>;
}

/// Offsets of a tag's four corners from its center, in the tag's own frame
/// using field axis conventions (x out of the tag face, y left, z up),
/// index-matched to the canonical detected corner order.
fn corner_offsets(tag_size: f64) -> [Vector3<f64>; 4] {
    let h = tag_size / 2.0;
    [
        Vector3::new(0.0, h, -h),
        Vector3::new(0.0, -h, -h),
        Vector3::new(0.0, -h, h),
        Vector3::new(0.0, h, h),
    ]
}

/// Object points for the planar solve, in tag-local CV space (z = 0 plane),
/// index-matched to the canonical detected corner order.
fn planar_object_points(tag_size: f64) -> [Vector3<f64>; 4] {
    let h = tag_size / 2.0;
    [
        Vector3::new(-h, h, 0.0),
        Vector3::new(h, h, 0.0),
        Vector3::new(h, -h, 0.0),
        Vector3::new(-h, -h, 0.0),
    ]
}

#[derive(Clone)]
pub struct PoseEstimator {
    backend: Arc<dyn PnpBackend>,
}

impl PoseEstimator {
    pub fn new(backend: Arc<dyn PnpBackend>) -> Self {
        Self { backend }
    }

    /// Estimate the field-to-camera pose for one frame's detections.
    ///
    /// Solver failures and frames without known tags both yield `None`;
    /// neither is fatal to the pipeline.
    pub fn solve(
        &self,
        calibration: &CameraCalibration,
        detections: &[TagObservation],
        environment: &TagEnvironment,
    ) -> Option<EstimatePair> {
        let known = usable_detections(detections, environment);
        let result = match known.len() {
            0 => return None,
            1 => self.solve_single(calibration, known[0], environment),
            _ => self.solve_multi(calibration, &known, environment),
        };
        match result {
            Ok(pair) => Some(pair),
            Err(e) => {
                log::warn!("pose solve failed: {}", e);
                None
            }
        }
    }

    fn solve_single(
        &self,
        calibration: &CameraCalibration,
        detection: &TagObservation,
        environment: &TagEnvironment,
    ) -> Result<EstimatePair> {
        let object = planar_object_points(environment.tag_size);
        let observed = pixel_corners(detection);
        let candidates = self
            .backend
            .solve_planar_square(calibration, &object, &observed)?;

        // tag_pose is checked by usable_detections.
        let tag_pose = environment
            .tag_pose(detection.id)
            .copied()
            .unwrap_or_else(Isometry3::identity);
        let [first, second] = candidates;
        let mut a = camera_to_tag_estimate(&tag_pose, &first);
        let mut b = camera_to_tag_estimate(&tag_pose, &second);
        if b.reprojection_error < a.reprojection_error {
            std::mem::swap(&mut a, &mut b);
        }
        Ok(EstimatePair {
            pose_a: a,
            pose_b: Some(b),
        })
    }

    fn solve_multi(
        &self,
        calibration: &CameraCalibration,
        detections: &[&TagObservation],
        environment: &TagEnvironment,
    ) -> Result<EstimatePair> {
        let offsets = corner_offsets(environment.tag_size);
        let mut object = Vec::with_capacity(detections.len() * 4);
        let mut observed = Vec::with_capacity(detections.len() * 4);
        for detection in detections {
            let tag_pose = environment
                .tag_pose(detection.id)
                .copied()
                .unwrap_or_else(Isometry3::identity);
            for (offset, corner) in offsets.iter().zip(&detection.corners) {
                let field = tag_pose.transform_point(&Point3::from(*offset));
                object.push(geom::field_to_cv_translation(&field.coords));
                observed.push(Point2::new(corner[0], corner[1]));
            }
        }

        let solution = self.backend.solve_general(calibration, &object, &observed)?;
        // The general solve is camera-to-field; invert for field-to-camera.
        let pose = geom::cv_pose_to_field(&solution.rvec, &solution.tvec).inverse();
        Ok(EstimatePair {
            pose_a: PoseEstimate {
                pose,
                reprojection_error: solution.reprojection_error,
            },
            pose_b: None,
        })
    }
}

/// Field-to-camera estimate from a single-tag camera-to-tag candidate.
fn camera_to_tag_estimate(tag_pose: &Isometry3<f64>, solution: &PnpSolution) -> PoseEstimate {
    let camera_to_tag = geom::cv_pose_to_field(&solution.rvec, &solution.tvec);
    PoseEstimate {
        pose: tag_pose * camera_to_tag.inverse(),
        reprojection_error: solution.reprojection_error,
    }
}

fn pixel_corners(detection: &TagObservation) -> [Point2<f64>; 4] {
    let c = &detection.corners;
    [
        Point2::new(c[0][0], c[0][1]),
        Point2::new(c[1][0], c[1][1]),
        Point2::new(c[2][0], c[2][1]),
        Point2::new(c[3][0], c[3][1]),
    ]
}

/// Keep detections whose id is known in the environment, excluding every
/// detection that shares an id with another in the same frame. Duplicate ids
/// within one frame are undefined input; dropping beats guessing a merge.
fn usable_detections<'a>(
    detections: &'a [TagObservation],
    environment: &TagEnvironment,
) -> Vec<&'a TagObservation> {
    let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
    for detection in detections {
        *counts.entry(detection.id).or_insert(0) += 1;
    }
    let duplicates: Vec<u8> = counts
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| *id)
        .collect();
    if !duplicates.is_empty() {
        log::warn!("duplicate tag ids in one frame, ignoring: {:?}", duplicates);
    }
    detections
        .iter()
        .filter(|d| counts.get(&d.id) == Some(&1) && environment.tag_pose(d.id).is_some())
        .collect()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
