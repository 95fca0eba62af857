// Orientation analysis of a track's display transform

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::model::{AffineTransform, Size};

/// Rotation in 90-degree steps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Map clockwise degrees (any multiple of 90, negatives allowed) onto a rotation
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    /// Whether an upright frame has width and height exchanged
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Canonical 2x2 submatrix `(a, b, c, d)` of this rotation
    pub fn canonical_matrix(&self) -> (f64, f64, f64, f64) {
        match self {
            Rotation::Deg0 => (1.0, 0.0, 0.0, 1.0),
            Rotation::Deg90 => (0.0, 1.0, -1.0, 0.0),
            Rotation::Deg180 => (-1.0, 0.0, 0.0, -1.0),
            Rotation::Deg270 => (0.0, -1.0, 1.0, 0.0),
        }
    }

    /// Transform that turns a frame of `natural_size` upright, translated back
    /// into the positive quadrant of the render area
    pub fn correction_transform(&self, natural_size: Size) -> AffineTransform {
        let (w, h) = (natural_size.width as f64, natural_size.height as f64);
        let (a, b, c, d) = self.canonical_matrix();
        match self {
            Rotation::Deg0 => AffineTransform::identity(),
            Rotation::Deg90 => AffineTransform::new(a, b, c, d, h, 0.0),
            Rotation::Deg180 => AffineTransform::new(a, b, c, d, w, h),
            Rotation::Deg270 => AffineTransform::new(a, b, c, d, 0.0, w),
        }
    }

    /// Size of the upright frame
    pub fn render_size(&self, natural_size: Size) -> Size {
        if self.swaps_dimensions() {
            natural_size.swapped()
        } else {
            natural_size
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Classify a display transform into one of the four rotations.
///
/// Only exact canonical matrices are recognised; skew, scale and non-right-angle
/// rotations all report `Deg0` and are left uncorrected.
pub fn rotation_of(transform: &AffineTransform) -> Rotation {
    let matrix = (transform.a, transform.b, transform.c, transform.d);
    [Rotation::Deg90, Rotation::Deg270, Rotation::Deg0, Rotation::Deg180]
        .into_iter()
        .find(|rotation| rotation.canonical_matrix() == matrix)
        .unwrap_or(Rotation::Deg0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_of_canonical_forms() {
        assert_eq!(rotation_of(&AffineTransform::identity()), Rotation::Deg0);
        assert_eq!(
            rotation_of(&AffineTransform::new(0.0, 1.0, -1.0, 0.0, 1080.0, 0.0)),
            Rotation::Deg90
        );
        assert_eq!(
            rotation_of(&AffineTransform::new(-1.0, 0.0, 0.0, -1.0, 0.0, 0.0)),
            Rotation::Deg180
        );
        assert_eq!(
            rotation_of(&AffineTransform::new(0.0, -1.0, 1.0, 0.0, 0.0, 0.0)),
            Rotation::Deg270
        );
    }

    #[test]
    fn test_rotation_of_non_canonical_is_zero() {
        assert_eq!(rotation_of(&AffineTransform::scale(2.0, 2.0)), Rotation::Deg0);
        let tilted = AffineTransform::new(0.7071, 0.7071, -0.7071, 0.7071, 0.0, 0.0);
        assert_eq!(rotation_of(&tilted), Rotation::Deg0);
    }

    #[test]
    fn test_from_degrees() {
        assert_eq!(Rotation::from_degrees(90), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Deg270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn test_correction_maps_frame_into_render_area() {
        let natural = Size::new(1920, 1080);
        for rotation in [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270] {
            let transform = rotation.correction_transform(natural);
            let render = rotation.render_size(natural);
            for (x, y) in [(0.0, 0.0), (1920.0, 0.0), (0.0, 1080.0), (1920.0, 1080.0)] {
                let (rx, ry) = transform.apply(x, y);
                assert!(rx >= 0.0 && rx <= render.width as f64, "{} x={}", rotation, rx);
                assert!(ry >= 0.0 && ry <= render.height as f64, "{} y={}", rotation, ry);
            }
        }
    }

    #[test]
    fn test_render_size_swaps_for_quarter_turns() {
        let natural = Size::new(1920, 1080);
        assert_eq!(Rotation::Deg90.render_size(natural), Size::new(1080, 1920));
        assert_eq!(Rotation::Deg270.render_size(natural), Size::new(1080, 1920));
        assert_eq!(Rotation::Deg180.render_size(natural), natural);
        assert_eq!(Rotation::Deg0.render_size(natural), natural);
    }
}
