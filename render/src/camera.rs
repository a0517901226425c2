use glam::{Affine3A, Mat3, UVec2, Vec3};

/// A pinhole camera. `rotation` and `translation` map world points into camera space
/// (`x_cam = R * x_world + T`), the way COLMAP stores extrinsics.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub rotation: Mat3,
    pub translation: Vec3,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: u32,
    pub height: u32,
    /// Color composited behind transparent training images.
    pub background: Vec3,
}

impl Camera {
    pub fn new(rotation: Mat3, translation: Vec3, fx: f32, fy: f32, width: u32, height: u32) -> Self {
        Self {
            rotation,
            translation,
            fx,
            fy,
            cx: width as f32 / 2.0,
            cy: height as f32 / 2.0,
            width,
            height,
            background: Vec3::ONE,
        }
    }

    pub fn from_fov(rotation: Mat3, translation: Vec3, fov_x: f32, width: u32, height: u32) -> Self {
        let fx = fov_to_focal(fov_x, width);
        Self::new(rotation, translation, fx, fx, width, height)
    }

    pub fn with_background(mut self, background: Vec3) -> Self {
        self.background = background;
        self
    }

    pub fn world_to_local(&self) -> Affine3A {
        Affine3A::from_mat3_translation(self.rotation, self.translation)
    }

    pub fn local_to_world(&self) -> Affine3A {
        self.world_to_local().inverse()
    }

    /// Camera center in world space.
    pub fn position(&self) -> Vec3 {
        -(self.rotation.transpose() * self.translation)
    }

    pub fn fov_x(&self) -> f32 {
        focal_to_fov(self.fx, self.width)
    }

    pub fn fov_y(&self) -> f32 {
        focal_to_fov(self.fy, self.height)
    }

    pub fn size(&self) -> UVec2 {
        glam::uvec2(self.width, self.height)
    }
}

pub fn focal_to_fov(focal: f32, pixels: u32) -> f32 {
    2.0 * f32::atan(pixels as f32 / (2.0 * focal))
}

pub fn fov_to_focal(fov: f32, pixels: u32) -> f32 {
    pixels as f32 / (2.0 * f32::tan(fov * 0.5))
}

#[cfg(test)]
mod tests {
    use glam::{Mat3, Vec3};

    use super::Camera;

    #[test]
    fn center_is_inverse_of_extrinsics() {
        let rotation = Mat3::from_rotation_y(0.4);
        let center = Vec3::new(1.0, -2.0, 3.0);
        let translation = -(rotation * center);
        let camera = Camera::new(rotation, translation, 500.0, 500.0, 640, 480);

        assert!((camera.position() - center).length() < 1e-5);
        assert!(camera.world_to_local().transform_point3(center).length() < 1e-5);
    }

    #[test]
    fn fov_focal_round_trip() {
        let camera = Camera::from_fov(Mat3::IDENTITY, Vec3::ZERO, 0.9, 800, 600);
        assert!((camera.fov_x() - 0.9).abs() < 1e-5);
    }
}
