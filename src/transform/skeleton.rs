use super::{NodeHandle, PoolTransform, RelativeTransform, INVALID_NODE};

pub const INVALID_JOINT: u32 = !0;

/// A skeleton definition: per-joint parent links (within the skeleton) and
/// optional per-joint default relative transforms.
pub struct Skeleton {
    joint_parents: Vec<u32>,
    default_transforms: Option<Vec<RelativeTransform>>,
}

impl Skeleton {
    pub fn new(
        joint_parents: Vec<u32>,
        default_transforms: Option<Vec<RelativeTransform>>,
    ) -> Self {
        if let Some(transforms) = &default_transforms {
            assert_eq!(transforms.len(), joint_parents.len());
        }
        Self {
            joint_parents,
            default_transforms,
        }
    }
    pub fn joint_count(&self) -> u32 {
        self.joint_parents.len() as u32
    }
    pub fn parent_of(&self, joint: u32) -> u32 {
        self.joint_parents[joint as usize]
    }
    pub fn has_default_transforms(&self) -> bool {
        self.default_transforms.is_some()
    }
}

/// Exact scratch sizes for a skeleton batch, so callers can preallocate
/// before the fill phase touches anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagingRequirements {
    /// Total nodes the batch allocates (joints x instances).
    pub node_count: u32,
    /// Elements of parent scratch, one per joint instance.
    pub parent_count: u32,
    /// Elements of transform scratch. Transforms are stored once per skeleton
    /// joint and gathered per instance; zero when no skeleton carries
    /// defaults.
    pub transform_count: u32,
    /// Gather indices into the transform scratch, one per joint instance.
    pub source_index_count: u32,
}

pub fn staging_requirements(
    skeletons: &[Skeleton],
    instance_counts: Option<&[u32]>,
) -> StagingRequirements {
    let any_defaults = skeletons.iter().any(Skeleton::has_default_transforms);
    let mut reqs = StagingRequirements::default();
    for (ix, skeleton) in skeletons.iter().enumerate() {
        let instances = instance_counts.map_or(1, |counts| counts[ix]);
        let joint_instances = instances * skeleton.joint_count();
        reqs.node_count += joint_instances;
        reqs.parent_count += joint_instances;
        if any_defaults {
            reqs.transform_count += skeleton.joint_count();
            reqs.source_index_count += joint_instances;
        }
    }
    reqs
}

/// Fill phase: flatten every skeleton instance over the already-allocated
/// `out_nodes`, remapping intra-skeleton joint parents to that instance's
/// handles and attaching each instance's roots to the caller-supplied
/// external parent (or `INVALID_NODE`).
///
/// When any skeleton carries default transforms, each skeleton's transforms
/// are written once and gathered per joint instance through the source index
/// scratch; skeletons without defaults contribute identities so the gather
/// never reads unwritten elements.
pub(crate) fn expand_skeletons(
    skeletons: &[Skeleton],
    instance_counts: Option<&[u32]>,
    instance_parents: Option<&[&[NodeHandle]]>,
    out_nodes: &[NodeHandle],
    parent_scratch: &mut [NodeHandle],
    transform_scratch: &mut [PoolTransform],
    source_index_scratch: &mut [u32],
) {
    let gather_transforms = !transform_scratch.is_empty();
    let mut base_joint_instance = 0usize;
    let mut base_joint = 0usize;
    for (ix, skeleton) in skeletons.iter().enumerate() {
        let joint_count = skeleton.joint_count() as usize;
        let instances = instance_counts.map_or(1, |counts| counts[ix]) as usize;
        let parents_of_instances = instance_parents.map_or(&[][..], |parents| parents[ix]);
        for instance in 0..instances {
            for joint in 0..joint_count {
                let parent = skeleton.parent_of(joint as u32);
                parent_scratch[base_joint_instance + joint] = if parent != INVALID_JOINT {
                    out_nodes[base_joint_instance + parent as usize]
                } else {
                    parents_of_instances
                        .get(instance)
                        .copied()
                        .unwrap_or(INVALID_NODE)
                };
                if gather_transforms {
                    source_index_scratch[base_joint_instance + joint] =
                        (base_joint + joint) as u32;
                }
            }
            base_joint_instance += joint_count;
        }
        if gather_transforms {
            for joint in 0..joint_count {
                transform_scratch[base_joint + joint] = skeleton
                    .default_transforms
                    .as_ref()
                    .map_or(PoolTransform::IDENTITY, |transforms| transforms[joint].into());
            }
        }
        base_joint += joint_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn chain3() -> Skeleton {
        // root -> 0 -> 1 -> 2
        Skeleton::new(vec![INVALID_JOINT, 0, 1], None)
    }

    #[test]
    fn requirements_without_defaults() {
        let skeletons = [chain3(), Skeleton::new(vec![INVALID_JOINT, 0], None)];
        let reqs = staging_requirements(&skeletons, Some(&[2, 3]));
        assert_eq!(
            reqs,
            StagingRequirements {
                node_count: 12,
                parent_count: 12,
                transform_count: 0,
                source_index_count: 0,
            }
        );
    }

    #[test]
    fn requirements_with_mixed_defaults() {
        let with_defaults = Skeleton::new(
            vec![INVALID_JOINT, 0],
            Some(vec![RelativeTransform::IDENTITY; 2]),
        );
        let skeletons = [chain3(), with_defaults];
        let reqs = staging_requirements(&skeletons, Some(&[1, 2]));
        // every skeleton contributes transforms once any carries defaults
        assert_eq!(
            reqs,
            StagingRequirements {
                node_count: 7,
                parent_count: 7,
                transform_count: 5,
                source_index_count: 7,
            }
        );
    }

    #[test]
    fn two_instances_reproduce_topology_disjointly() {
        let skeletons = [chain3()];
        let reqs = staging_requirements(&skeletons, Some(&[2]));
        assert_eq!(reqs.node_count, 6);
        // as if the tree handed back these handles
        let out_nodes: Vec<NodeHandle> = vec![10, 11, 12, 20, 21, 22];
        let externals = [[100u32, 200u32]];
        let external_refs: Vec<&[NodeHandle]> = externals.iter().map(|e| &e[..]).collect();
        let mut parent_scratch = vec![0u32; reqs.parent_count as usize];
        expand_skeletons(
            &skeletons,
            Some(&[2]),
            Some(&external_refs),
            &out_nodes,
            &mut parent_scratch,
            &mut [],
            &mut [],
        );
        // instance 0: root attached to 100, joints chained through 10, 11
        assert_eq!(&parent_scratch[0..3], &[100, 10, 11]);
        // instance 1: same topology remapped into its own handle range
        assert_eq!(&parent_scratch[3..6], &[200, 20, 21]);
    }

    #[test]
    fn missing_external_parents_fall_back_to_invalid() {
        let skeletons = [chain3()];
        let out_nodes = [5u32, 6, 7];
        let mut parent_scratch = [0u32; 3];
        expand_skeletons(
            &skeletons,
            None,
            None,
            &out_nodes,
            &mut parent_scratch,
            &mut [],
            &mut [],
        );
        assert_eq!(parent_scratch, [INVALID_NODE, 5, 6]);
    }

    #[test]
    fn mixed_defaults_fill_identity_for_the_rest() {
        let moved = RelativeTransform::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let skeletons = [
            Skeleton::new(vec![INVALID_JOINT], None),
            Skeleton::new(vec![INVALID_JOINT, 0], Some(vec![moved; 2])),
        ];
        let reqs = staging_requirements(&skeletons, None);
        let out_nodes = [0u32, 1, 2];
        let mut parent_scratch = vec![0u32; reqs.parent_count as usize];
        let mut transform_scratch =
            vec![PoolTransform::IDENTITY; reqs.transform_count as usize];
        let mut source_index_scratch = vec![0u32; reqs.source_index_count as usize];
        expand_skeletons(
            &skeletons,
            None,
            None,
            &out_nodes,
            &mut parent_scratch,
            &mut transform_scratch,
            &mut source_index_scratch,
        );
        let moved_pool = PoolTransform::from(moved);
        assert_eq!(transform_scratch[0], PoolTransform::IDENTITY);
        assert_eq!(&transform_scratch[1..], &[moved_pool, moved_pool]);
        assert_eq!(source_index_scratch, [0, 1, 2]);
    }
}
