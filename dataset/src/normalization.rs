use glam::Vec3;
use render::camera::Camera;

/// Where the cameras are and how far they spread out (the NeRF++ normalization).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneNormalization {
    pub center: Vec3,
    /// 1.1 times the largest camera distance from `center`.
    pub radius: f32,
}

impl SceneNormalization {
    /// Moves the scene so the cameras are centered around the origin.
    pub fn translate(&self) -> Vec3 {
        -self.center
    }
}

pub fn nerf_normalization(cameras: &[Camera]) -> SceneNormalization {
    if cameras.is_empty() {
        return SceneNormalization {
            center: Vec3::ZERO,
            radius: 1.0,
        };
    }

    let centers: Vec<Vec3> = cameras.iter().map(|c| c.position()).collect();
    let center = centers.iter().sum::<Vec3>() / centers.len() as f32;
    let diagonal = centers
        .iter()
        .map(|c| c.distance(center))
        .fold(0.0f32, f32::max);

    // A single camera (or all cameras in one spot) has no spread to measure.
    let radius = if diagonal > f32::EPSILON {
        diagonal * 1.1
    } else {
        1.0
    };
    SceneNormalization { center, radius }
}
