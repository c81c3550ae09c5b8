use nalgebra::{Point3, Vector3};
use serde::Deserialize;

/// The simulation volume that distances are measured in.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Space {
    /// Infinite, non-periodic space.
    #[default]
    Cartesian,
    /// Orthorhombic periodic box with the given side lengths.
    PeriodicBox { dimensions: [f64; 3] },
}

impl Space {
    pub fn periodic_box(x: f64, y: f64, z: f64) -> Self {
        Space::PeriodicBox {
            dimensions: [x, y, z],
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, Space::PeriodicBox { .. })
    }

    /// Plain Euclidean distance, never wrapped.
    pub fn direct_distance(p0: &Point3<f64>, p1: &Point3<f64>) -> f64 {
        (p1 - p0).norm()
    }

    /// Displacement from `from` to the nearest periodic image of `to`.
    ///
    /// Each component lies in the half-open interval `[-L/2, L/2)`.
    pub fn min_image_delta(&self, from: &Point3<f64>, to: &Point3<f64>) -> Vector3<f64> {
        let delta = to - from;
        match self {
            Space::Cartesian => delta,
            Space::PeriodicBox { dimensions } => Vector3::new(
                wrap_component(delta.x, dimensions[0]),
                wrap_component(delta.y, dimensions[1]),
                wrap_component(delta.z, dimensions[2]),
            ),
        }
    }

    pub fn calc_dist(&self, p0: &Point3<f64>, p1: &Point3<f64>) -> f64 {
        self.min_image_delta(p0, p1).norm()
    }

    /// Translation that moves `point` onto its periodic image nearest to `reference`.
    ///
    /// The translation is zero for a cartesian space and for points that are
    /// already the nearest image, so applying it twice is the same as once.
    pub fn translation_to_nearest_image(
        &self,
        reference: &Point3<f64>,
        point: &Point3<f64>,
    ) -> Vector3<f64> {
        match self {
            Space::Cartesian => Vector3::zeros(),
            Space::PeriodicBox { dimensions } => {
                let delta = point - reference;
                Vector3::new(
                    image_shift(delta.x, dimensions[0]),
                    image_shift(delta.y, dimensions[1]),
                    image_shift(delta.z, dimensions[2]),
                )
            }
        }
    }
}

fn image_shift(d: f64, length: f64) -> f64 {
    if length <= 0.0 {
        return 0.0;
    }
    let n = (d / length + 0.5).floor();
    if n == 0.0 { 0.0 } else { -n * length }
}

fn wrap_component(d: f64, length: f64) -> f64 {
    d + image_shift(d, length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cartesian_space_never_wraps() {
        let space = Space::Cartesian;
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(30.0, 0.0, 0.0);
        assert_eq!(space.calc_dist(&a, &b), 30.0);
        assert_eq!(space.translation_to_nearest_image(&a, &b), Vector3::zeros());
    }

    #[test]
    fn periodic_box_uses_minimum_image() {
        let space = Space::periodic_box(10.0, 10.0, 10.0);
        let a = Point3::new(1.0, 0.0, 0.0);
        let b = Point3::new(9.0, 0.0, 0.0);
        assert!((space.calc_dist(&a, &b) - 2.0).abs() < 1e-12);
        assert_eq!(Space::direct_distance(&a, &b), 8.0);
        let delta = space.min_image_delta(&a, &b);
        assert!((delta.x + 2.0).abs() < 1e-12);
    }

    #[test]
    fn translation_to_nearest_image_is_idempotent() {
        let space = Space::periodic_box(10.0, 10.0, 10.0);
        let reference = Point3::origin();
        let point = Point3::new(23.0, -7.0, 5.0);

        let shift = space.translation_to_nearest_image(&reference, &point);
        assert_eq!(shift, Vector3::new(-20.0, 10.0, -10.0));

        let moved = point + shift;
        assert_eq!(
            space.translation_to_nearest_image(&reference, &moved),
            Vector3::zeros()
        );
    }
}
