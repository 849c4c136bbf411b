//! Smallest-three quaternion compression into 32 bits.
//!
//! Layout: `index:2 | a:10 | b:10 | c:10`, where `index` names the component
//! with the largest magnitude and `a`, `b`, `c` are the remaining three in
//! x, y, z, w order, quantized over `[-1/sqrt(2), 1/sqrt(2)]`.

use glam::Quat;

const QUATERNION_MIN_RANGE: f32 = -0.707107;
const QUATERNION_MAX_RANGE: f32 = 0.707107;
const TEN_BITS_MAX: u32 = 0x3FF;

fn scale_to_ten_bits(value: f32) -> u32 {
    let clamped = value.clamp(QUATERNION_MIN_RANGE, QUATERNION_MAX_RANGE);
    let normalized = (clamped - QUATERNION_MIN_RANGE) / (QUATERNION_MAX_RANGE - QUATERNION_MIN_RANGE);
    (normalized * TEN_BITS_MAX as f32).round() as u32
}

fn scale_from_ten_bits(value: u32) -> f32 {
    let normalized = (value & TEN_BITS_MAX) as f32 / TEN_BITS_MAX as f32;
    QUATERNION_MIN_RANGE + normalized * (QUATERNION_MAX_RANGE - QUATERNION_MIN_RANGE)
}

fn largest_absolute_component(components: &[f32; 4]) -> usize {
    let mut index = 0;
    for i in 1..4 {
        if components[i].abs() > components[index].abs() {
            index = i;
        }
    }
    index
}

pub fn compress_quaternion(rotation: Quat) -> u32 {
    let q = rotation.normalize();
    let components = [q.x, q.y, q.z, q.w];
    let index = largest_absolute_component(&components);

    // q and -q are the same rotation; flip so the dropped component is positive.
    let sign = if components[index] < 0.0 { -1.0 } else { 1.0 };

    let mut packed = (index as u32) << 30;
    let mut shift = 20;
    for (i, component) in components.iter().enumerate() {
        if i == index {
            continue;
        }
        packed |= scale_to_ten_bits(component * sign) << shift;
        shift -= 10;
    }

    packed
}

pub fn decompress_quaternion(data: u32) -> Quat {
    let index = (data >> 30) as usize;
    let a = scale_from_ten_bits(data >> 20);
    let b = scale_from_ten_bits(data >> 10);
    let c = scale_from_ten_bits(data);

    let d = (1.0 - a * a - b * b - c * c).max(0.0).sqrt();

    let [x, y, z, w] = match index {
        0 => [d, a, b, c],
        1 => [a, d, b, c],
        2 => [a, b, d, c],
        _ => [a, b, c, d],
    };

    Quat::from_xyzw(x, y, z, w).normalize()
}

/// Angle in radians between two rotations, ignoring the q / -q ambiguity.
pub fn angular_distance(a: Quat, b: Quat) -> f32 {
    let dot = a.dot(b).abs().min(1.0);
    2.0 * dot.acos()
}
