use bytemuck::{Pod, Zeroable};
use glam::Vec3A;

use super::{NodeHandle, RelativeTransform};

/// How a modification request combines with a node's current relative
/// transform. The discriminant is the 2-bit tag carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TransformOp {
    /// Exchange the value: `This(vertex)`.
    Overwrite = 0,
    /// Apply after the current transform: `This(Previous(vertex))`.
    ConcatenateAfter = 1,
    /// Apply before the current transform: `Previous(This(vertex))`.
    ConcatenateBefore = 2,
    /// Component-wise add to the current value: `(Previous + This)(vertex)`.
    WeightedAccumulate = 3,
}

impl TransformOp {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Overwrite,
            1 => Self::ConcatenateAfter,
            2 => Self::ConcatenateBefore,
            _ => Self::WeightedAccumulate,
        }
    }
}

/// A request to alter one node's relative transform. This is the runtime
/// representation; the operation tag only gets packed into the matrix bits by
/// [`encode`](Self::encode) at the point of GPU upload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformModification {
    pub op: TransformOp,
    pub transform: RelativeTransform,
}

impl TransformModification {
    pub fn new(op: TransformOp, transform: RelativeTransform) -> Self {
        Self { op, transform }
    }

    /// Pre-weight the payload; the kernel never sees the weight itself.
    pub fn weighted(op: TransformOp, transform: RelativeTransform, weight: f32) -> Self {
        Self {
            op,
            transform: RelativeTransform {
                matrix3: transform.matrix3 * weight,
                translation: transform.translation * weight,
            },
        }
    }

    /// The compute kernel's semantics, host-side. Requests within a range are
    /// applied in array order by the relative-update dispatch.
    pub fn apply_to(&self, current: &mut RelativeTransform) {
        match self.op {
            TransformOp::Overwrite => *current = self.transform,
            TransformOp::ConcatenateAfter => *current = self.transform * *current,
            TransformOp::ConcatenateBefore => *current = *current * self.transform,
            TransformOp::WeightedAccumulate => {
                current.matrix3 += self.transform.matrix3;
                current.translation += self.transform.translation;
            }
        }
    }

    /// Pack to the wire format: the 2-bit tag is stolen from the lowest
    /// mantissa bits of the two scale components rows[0][0] and rows[2][2].
    pub fn encode(&self) -> PackedTransformModification {
        let mut rows = transform_to_rows(&self.transform);
        let tag = self.op as u32;
        rows[0][0] = f32::from_bits(rows[0][0].to_bits() & !1 | (tag & 0x1));
        rows[2][2] = f32::from_bits(rows[2][2].to_bits() & !1 | ((tag >> 1) & 0x1));
        PackedTransformModification { rows }
    }
}

/// Wire form of one modification request: a row-major 3x4 matrix whose two
/// lowest scale-mantissa bits carry the operation tag.
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct PackedTransformModification {
    pub rows: [[f32; 4]; 3],
}

impl PackedTransformModification {
    pub fn op(&self) -> TransformOp {
        let bits =
            (self.rows[0][0].to_bits() & 0x1) | ((self.rows[2][2].to_bits() & 0x1) << 1);
        TransformOp::from_bits(bits)
    }

    pub fn decode(&self) -> TransformModification {
        TransformModification {
            op: self.op(),
            transform: rows_to_transform(&self.rows),
        }
    }
}

/// A transform in the property pool's storage format: row-major 3x4, 48
/// bytes. Scratch buffers and uploads use this layout; the runtime
/// representation stays [`RelativeTransform`].
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct PoolTransform {
    pub rows: [[f32; 4]; 3],
}

impl PoolTransform {
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };
}

impl From<RelativeTransform> for PoolTransform {
    fn from(m: RelativeTransform) -> Self {
        Self {
            rows: transform_to_rows(&m),
        }
    }
}

impl From<PoolTransform> for RelativeTransform {
    fn from(m: PoolTransform) -> Self {
        rows_to_transform(&m.rows)
    }
}

fn transform_to_rows(m: &RelativeTransform) -> [[f32; 4]; 3] {
    let c = m.matrix3;
    let t = m.translation;
    [
        [c.x_axis.x, c.y_axis.x, c.z_axis.x, t.x],
        [c.x_axis.y, c.y_axis.y, c.z_axis.y, t.y],
        [c.x_axis.z, c.y_axis.z, c.z_axis.z, t.z],
    ]
}

fn rows_to_transform(rows: &[[f32; 4]; 3]) -> RelativeTransform {
    RelativeTransform::from_cols(
        Vec3A::new(rows[0][0], rows[1][0], rows[2][0]),
        Vec3A::new(rows[0][1], rows[1][1], rows[2][1]),
        Vec3A::new(rows[0][2], rows[1][2], rows[2][2]),
        Vec3A::new(rows[0][3], rows[1][3], rows[2][3]),
    )
}


/// One batched span of modification requests aimed at a single node. Requests
/// `begin..end` in the flat request array apply to `node`, in order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ModificationRequestRange {
    pub node: NodeHandle,
    pub begin: u32,
    pub end: u32,
}

/// Header at the front of the request-ranges buffer, followed by the packed
/// [`ModificationRequestRange`] array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RequestRangesHeader {
    pub range_count: u32,
    pub request_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn translation(x: f32, y: f32, z: f32) -> RelativeTransform {
        RelativeTransform::from_translation(Vec3::new(x, y, z))
    }

    #[test]
    fn overwrite_then_concatenate_after_orders_correctly() {
        let m1 = translation(1.0, 0.0, 0.0);
        let m2 = RelativeTransform::from_scale(Vec3::new(2.0, 2.0, 2.0));
        let mut current = RelativeTransform::from_rotation_translation(
            Quat::from_rotation_y(0.5),
            Vec3::new(9.0, 9.0, 9.0),
        );
        TransformModification::new(TransformOp::Overwrite, m1).apply_to(&mut current);
        TransformModification::new(TransformOp::ConcatenateAfter, m2).apply_to(&mut current);
        assert_eq!(current, m2 * m1);
        assert_ne!(current, m1 * m2);
    }

    #[test]
    fn concatenate_before() {
        let m1 = translation(0.0, 3.0, 0.0);
        let m2 = RelativeTransform::from_scale(Vec3::new(0.5, 0.5, 0.5));
        let mut current = m1;
        TransformModification::new(TransformOp::ConcatenateBefore, m2).apply_to(&mut current);
        assert_eq!(current, m1 * m2);
    }

    #[test]
    fn weighted_accumulate_sums_components() {
        let mut current = translation(1.0, 2.0, 3.0);
        let half = TransformModification::weighted(
            TransformOp::WeightedAccumulate,
            translation(4.0, 4.0, 4.0),
            0.5,
        );
        half.apply_to(&mut current);
        assert_eq!(current.translation, glam::Vec3A::new(3.0, 4.0, 5.0));
        // the identity basis accumulated a half-identity on top
        assert_eq!(current.matrix3.x_axis.x, 1.5);
    }

    #[test]
    fn encode_steals_exactly_two_bits() {
        let m = RelativeTransform::from_rotation_translation(
            Quat::from_rotation_z(1.2),
            Vec3::new(0.25, -3.5, 8.0),
        );
        for op in [
            TransformOp::Overwrite,
            TransformOp::ConcatenateAfter,
            TransformOp::ConcatenateBefore,
            TransformOp::WeightedAccumulate,
        ] {
            let packed = TransformModification::new(op, m).encode();
            assert_eq!(packed.op(), op);
            assert_eq!(packed.decode().op, op);
            // Everything except the two stolen mantissa bits survives.
            for (r, row) in packed.rows.iter().enumerate() {
                for (c, &value) in row.iter().enumerate() {
                    let reference = m.matrix3;
                    let expected = if c == 3 {
                        m.translation[r]
                    } else {
                        reference.col(c)[r]
                    };
                    if (r, c) == (0, 0) || (r, c) == (2, 2) {
                        assert!((value - expected).abs() <= f32::EPSILON * expected.abs().max(1.0));
                    } else {
                        assert_eq!(value.to_bits(), expected.to_bits());
                    }
                }
            }
        }
    }

    #[test]
    fn recompute_composition_root_outward() {
        // Root -> A -> B composes root-first, as the recompute kernel does by
        // folding each parent's transform onto the accumulated child chain.
        let tr = translation(1.0, 0.0, 0.0);
        let ta = RelativeTransform::from_rotation_translation(
            Quat::from_rotation_x(0.3),
            Vec3::new(0.0, 2.0, 0.0),
        );
        let tb = RelativeTransform::from_scale(Vec3::new(2.0, 1.0, 1.0));
        // kernel order: start at B, fold A, then the root
        let mut global = tb;
        global = ta * global;
        global = tr * global;
        assert_eq!(global, tr * ta * tb);
    }
}
