//! Joint Angle Engine
//!
//! Quaternion algebra and Euler conversion used to turn two sensor
//! orientations into the relative angle of the joint between them.

use crate::domain::models::{EulerAngles, Quaternion};

/// Hamilton product `a * b`.
pub fn multiply(a: Quaternion, b: Quaternion) -> Quaternion {
    Quaternion {
        w: a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
        x: a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
        y: a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
        z: a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
    }
}

pub fn conjugate(q: Quaternion) -> Quaternion {
    Quaternion {
        w: q.w,
        x: -q.x,
        y: -q.y,
        z: -q.z,
    }
}

/// Multiplicative inverse. Works for non-unit input; a zero quaternion has no
/// inverse and yields NaN components.
pub fn inverse(q: Quaternion) -> Quaternion {
    let norm_sq = q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z;
    let c = conjugate(q);
    Quaternion {
        w: c.w / norm_sq,
        x: c.x / norm_sq,
        y: c.y / norm_sq,
        z: c.z / norm_sq,
    }
}

/// Roll/pitch/yaw extraction in degrees. Pitch saturates at ±90° when the
/// sine term leaves [-1, 1] (gimbal lock).
pub fn to_euler_degrees(q: Quaternion) -> EulerAngles {
    let (w, x, y, z) = (q.w as f64, q.x as f64, q.y as f64, q.z as f64);

    // roll / x
    let sinr_cosp = 2.0 * (w * x + y * z);
    let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
    let roll = sinr_cosp.atan2(cosr_cosp);

    // pitch / y
    let sinp = 2.0 * (w * y - z * x);
    let pitch = if sinp.abs() >= 1.0 {
        std::f64::consts::FRAC_PI_2.copysign(sinp)
    } else {
        sinp.asin()
    };

    // yaw / z
    let siny_cosp = 2.0 * (w * z + x * y);
    let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
    let yaw = siny_cosp.atan2(cosy_cosp);

    EulerAngles {
        x: roll.to_degrees() as f32,
        y: pitch.to_degrees() as f32,
        z: yaw.to_degrees() as f32,
    }
}

/// Wrap an angle into (-180, 180].
pub fn wrap_degrees(angle: f32) -> f32 {
    let mut a = angle % 360.0;
    if a > 180.0 {
        a -= 360.0;
    } else if a <= -180.0 {
        a += 360.0;
    }
    a
}

/// Relative orientation of `q_distal` in the frame of `q_proximal`.
pub fn compute_joint_angle(q_proximal: Quaternion, q_distal: Quaternion) -> EulerAngles {
    let delta = multiply(inverse(q_proximal), q_distal);
    let euler = to_euler_degrees(delta);
    EulerAngles {
        x: wrap_degrees(euler.x),
        y: wrap_degrees(euler.y),
        z: wrap_degrees(euler.z),
    }
}
