use serde::{Deserialize, Serialize};

/// A 3D pose (position + orientation).
///
/// Position is in meters, orientation is a unit quaternion stored as
/// `[w, x, y, z]` where `w` is the scalar part.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Position in meters: `[x, y, z]`.
    pub position: [f64; 3],
    /// Orientation as unit quaternion: `[w, x, y, z]`.
    pub orientation: [f64; 4],
}

impl Pose {
    /// Creates a new pose from position and orientation.
    #[must_use]
    pub const fn new(position: [f64; 3], orientation: [f64; 4]) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Creates the identity pose (at origin, no rotation).
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            orientation: [1.0, 0.0, 0.0, 0.0],
        }
    }

    /// Creates a pose with only translation (no rotation).
    #[must_use]
    pub const fn from_translation(position: [f64; 3]) -> Self {
        Self {
            position,
            orientation: [1.0, 0.0, 0.0, 0.0],
        }
    }

    /// Creates a pose from a position and roll/pitch/yaw angles in radians.
    #[must_use]
    pub fn from_rpy(position: [f64; 3], roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (roll * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        let (sy, cy) = (yaw * 0.5).sin_cos();
        Self {
            position,
            orientation: [
                cr * cp * cy + sr * sp * sy,
                sr * cp * cy - cr * sp * sy,
                cr * sp * cy + sr * cp * sy,
                cr * cp * sy - sr * sp * cy,
            ],
        }
    }

    /// Rotation about the x axis, in `(-π, π]`.
    #[must_use]
    pub fn roll(&self) -> f64 {
        let [w, x, y, z] = self.orientation;
        let sinr_cosp = 2.0 * (w * x + y * z);
        let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
        sinr_cosp.atan2(cosr_cosp)
    }

    /// Returns the quaternion norm (should be ~1.0 for valid poses).
    #[must_use]
    pub fn quaternion_norm(&self) -> f64 {
        let [w, x, y, z] = self.orientation;
        w.mul_add(w, x.mul_add(x, y.mul_add(y, z * z))).sqrt()
    }

    /// Expresses `child`, given in this pose's frame, in the parent frame.
    ///
    /// With `self` the mount pose of a sensor in the world frame and `child`
    /// a detection in the sensor frame, the result is the world pose.
    #[must_use]
    pub fn compose(&self, child: &Pose) -> Pose {
        let rotated = rotate(self.orientation, child.position);
        Pose {
            position: [
                self.position[0] + rotated[0],
                self.position[1] + rotated[1],
                self.position[2] + rotated[2],
            ],
            orientation: hamilton(self.orientation, child.orientation),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

fn hamilton(a: [f64; 4], b: [f64; 4]) -> [f64; 4] {
    let [w1, x1, y1, z1] = a;
    let [w2, x2, y2, z2] = b;
    [
        w1 * w2 - x1 * x2 - y1 * y2 - z1 * z2,
        w1 * x2 + x1 * w2 + y1 * z2 - z1 * y2,
        w1 * y2 - x1 * z2 + y1 * w2 + z1 * x2,
        w1 * z2 + x1 * y2 - y1 * x2 + z1 * w2,
    ]
}

// v' = v + w*t + q_xyz × t, with t = 2 * (q_xyz × v)
fn rotate(q: [f64; 4], v: [f64; 3]) -> [f64; 3] {
    let [w, x, y, z] = q;
    let u = [x, y, z];
    let c = cross(u, v);
    let t = [2.0 * c[0], 2.0 * c[1], 2.0 * c[2]];
    let c2 = cross(u, t);
    [
        v[0] + w * t[0] + c2[0],
        v[1] + w * t[1] + c2[1],
        v[2] + w * t[2] + c2[2],
    ]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
