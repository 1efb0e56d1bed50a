//! Ground-truth camera for generating exact test scenes.
//!
//! World frame: meters, z up, ground plane z = 0. SAT pixels are world x/y
//! scaled by `px_per_meter`.

use crate::{distort, CameraPose, DistortionCoefficients, Homography, Intrinsics};
use nalgebra::{Matrix3, Point2, Vector3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyntheticCamera {
    pub intrinsics: Intrinsics,
    pub distortion: DistortionCoefficients,
    /// World -> camera rotation (camera x right, y down, z forward).
    pub rotation: Matrix3<f64>,
    /// Optical center in world meters.
    pub center: Vector3<f64>,
    pub px_per_meter: f64,
}

impl SyntheticCamera {
    /// Camera at `center` whose optical axis has compass angle `yaw_deg`
    /// (from +x towards +y) and tilts `pitch_deg` below the horizon.
    pub fn looking_down(
        intrinsics: Intrinsics,
        distortion: DistortionCoefficients,
        center: Vector3<f64>,
        yaw_deg: f64,
        pitch_deg: f64,
        px_per_meter: f64,
    ) -> Self {
        let (sy, cy) = yaw_deg.to_radians().sin_cos();
        let (sp, cp) = pitch_deg.to_radians().sin_cos();
        let forward = Vector3::new(cp * cy, cp * sy, -sp);
        let right = Vector3::new(sy, -cy, 0.0);
        let down = forward.cross(&right);
        let rotation = Matrix3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);
        Self {
            intrinsics,
            distortion,
            rotation,
            center,
            px_per_meter,
        }
    }

    /// Ideal (undistorted) pixel of a world point in front of the camera.
    pub fn project_ideal(&self, world: Vector3<f64>) -> Option<Point2<f64>> {
        let pc = self.rotation * (world - self.center);
        if pc.z <= 1e-9 {
            return None;
        }
        let k = &self.intrinsics;
        Some(Point2::new(
            k.fx * pc.x / pc.z + k.cx,
            k.fy * pc.y / pc.z + k.cy,
        ))
    }

    /// Raw (distorted) pixel of a world point.
    pub fn project(&self, world: Vector3<f64>) -> Option<Point2<f64>> {
        self.project_ideal(world)
            .map(|p| distort(p, &self.intrinsics, &self.distortion))
    }

    /// SAT pixel of the ground point below `world`.
    pub fn sat(&self, world: Vector3<f64>) -> Point2<f64> {
        Point2::new(world.x * self.px_per_meter, world.y * self.px_per_meter)
    }

    /// World point on the ground below a SAT pixel, raised by `height_m`.
    pub fn world(&self, sat: Point2<f64>, height_m: f64) -> Vector3<f64> {
        Vector3::new(sat.x / self.px_per_meter, sat.y / self.px_per_meter, height_m)
    }

    /// Undistorted CCTV -> SAT homography of the ground plane.
    pub fn homography(&self) -> Option<Homography> {
        let s = self.px_per_meter;
        let r1 = self.rotation.column(0) / s;
        let r2 = self.rotation.column(1) / s;
        let t = -(self.rotation * self.center);
        let img_from_sat = self.intrinsics.matrix() * Matrix3::from_columns(&[r1, r2, t]);
        Homography::new(img_from_sat).inverse()
    }

    pub fn pose(&self) -> CameraPose {
        CameraPose {
            position_sat: self.sat(self.center),
            height_m: self.center.z,
            px_per_meter: self.px_per_meter,
        }
    }
}
