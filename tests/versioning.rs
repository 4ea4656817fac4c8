//! Version numbering on a single address space.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use stratum::Config;
use stratum::Runtime;
use stratum::logical::RegionRequirement;
use stratum::logical::projection::Domain;
use stratum::logical::projection::FIRST_EPOCH;
use stratum::logical::projection::ProjectionFunction;
use stratum::logical::projection::ProjectionInfo;
use stratum::primitives::AddressSpace;
use stratum::primitives::ContextId;
use stratum::primitives::FieldId;
use stratum::primitives::FieldMask;
use stratum::primitives::NodeId;
use stratum::primitives::OpRef;
use stratum::primitives::RegionForest;
use stratum::primitives::RegionUsage;
use stratum::primitives::UniqueId;
use stratum::primitives::VersionId;
use stratum::primitives::ViewId;
use stratum::transport::DeliveryMode;
use stratum::transport::LocalNetwork;
use stratum::version::AdvanceArgs;
use stratum::version::AdvanceOutcome;
use stratum::version::OwnerDirectory;
use stratum::version::VersionInfo;
use stratum::version::VersionTracker;

// =============================================================================
// Test helpers
// =============================================================================

const CTX: ContextId = ContextId(0);

struct Setup {
    runtime: Arc<Runtime>,
    root: NodeId,
    partition: NodeId,
    subregions: Vec<NodeId>,
}

fn setup() -> Setup {
    let forest = Arc::new(RegionForest::new());
    let root = forest.create_region();
    let (partition, subregions) = forest.create_partition_with(root, 0, true, 4);
    let network = LocalNetwork::new(DeliveryMode::Inline);
    let runtime = Runtime::new(AddressSpace(0), Config::default(), forest, network.clone(), Arc::new(OwnerDirectory::new()));
    network.attach(&runtime);
    return Setup { runtime, root, partition, subregions };
}

fn f(fields: &[u32]) -> FieldMask {
    return FieldMask::from_fields(fields);
}

/// Run the versioning analysis of `req` and wait for its contents.
fn analyze(runtime: &Runtime, uid: u64, req: &RegionRequirement) -> VersionInfo {
    let mut info = VersionInfo::new();
    runtime.perform_versioning_analysis(CTX, UniqueId(uid), req, &mut info).unwrap().wait();
    info.capture_physical_states();
    return info;
}

fn group(model: &BTreeMap<(NodeId, FieldId), VersionId>, node: NodeId) -> BTreeMap<VersionId, FieldMask> {
    let mut out: BTreeMap<VersionId, FieldMask> = BTreeMap::new();
    for ((at, field), version) in model {
        if *at == node {
            out.entry(*version).or_default().insert(*field);
        }
    }
    return out;
}

#[derive(Clone, Debug)]
struct Access {
    child: Option<usize>,
    write: bool,
    fields: u64,
}

fn arbitrary_access() -> impl Strategy<Value = Access> {
    return (prop::option::of(0usize..4), any::<bool>(), 1u64..64)
        .prop_map(|(child, write, fields)| Access { child, write, fields });
}

// =============================================================================
// Version numbers
// =============================================================================

#[test]
fn first_read_materializes_the_initial_version() {
    let s = setup();
    let req = RegionRequirement::new(s.root, s.root, RegionUsage::read_only(), f(&[0, 1]));
    let info = analyze(&s.runtime, 1, &req);
    assert_eq!(info.field_versions(0), BTreeMap::from([(1, f(&[0, 1]))]));
    let manager = s.runtime.version_manager(s.root, CTX).unwrap();
    assert_eq!(manager.current_versions(), BTreeMap::from([(1, f(&[0, 1]))]));
    assert!(manager.previous_versions().is_empty());
}

#[test]
fn writes_advance_and_keep_one_previous_version() {
    let s = setup();
    let write = RegionRequirement::new(s.root, s.root, RegionUsage::read_write(), f(&[0]));
    analyze(&s.runtime, 1, &write);
    let second = analyze(&s.runtime, 2, &write);

    let manager = s.runtime.version_manager(s.root, CTX).unwrap();
    assert_eq!(manager.current_versions(), BTreeMap::from([(3, f(&[0]))]));
    assert_eq!(manager.previous_versions(), BTreeMap::from([(2, f(&[0]))]));

    // The writer reads the version it replaces and writes the new one.
    assert_eq!(second.split_mask(0), f(&[0]));
    let mut read = BTreeMap::new();
    second.get_field_versions(0, true, f(&[0]), &mut read);
    assert_eq!(read, BTreeMap::from([(2, f(&[0]))]));
    let mut written = BTreeMap::new();
    second.get_advance_versions(0, f(&[0]), &mut written);
    assert_eq!(written, BTreeMap::from([(3, f(&[0]))]));
}

#[test]
fn subregion_writes_open_the_parent() {
    let s = setup();
    let target = s.subregions[2];
    let write = RegionRequirement::new(s.root, target, RegionUsage::read_write(), f(&[0]));
    let info = analyze(&s.runtime, 1, &write);

    assert!(info.physical_state(0).is_some_and(|p| p.path_only));
    assert!(info.physical_state(1).is_some_and(|p| p.path_only));
    assert!(info.physical_state(2).is_some_and(|p| !p.path_only));

    let parent = s.runtime.version_manager(s.partition, CTX).unwrap();
    let states = parent.current_states(f(&[0]));
    assert_eq!(states.len(), 1);
    let children = states[0].0.children(f(&[0]));
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].0, 2);
    assert_eq!(children[0].1[0].0.version, 2);
}

#[test]
fn deleted_managers_start_over() {
    let s = setup();
    let write = RegionRequirement::new(s.root, s.root, RegionUsage::read_write(), f(&[0]));
    analyze(&s.runtime, 1, &write);
    let reset = s.runtime.invalidate_version_context(CTX, s.root);
    assert_eq!(reset.managers, 1);
    assert!(reset.invalidated.has_triggered());
    let read = RegionRequirement::new(s.root, s.root, RegionUsage::read_only(), f(&[0]));
    let info = analyze(&s.runtime, 2, &read);
    assert_eq!(info.field_versions(0), BTreeMap::from([(1, f(&[0]))]));
}

#[test]
fn seeded_versions_hand_their_views_to_the_first_reader() {
    let s = setup();
    let views = BTreeMap::from([(ViewId(3), f(&[0, 1])), (ViewId(4), f(&[2]))]);
    s.runtime.initialize_version_state(CTX, s.root, f(&[0, 1]), &views).unwrap();
    let manager = s.runtime.version_manager(s.root, CTX).unwrap();
    assert_eq!(manager.current_versions(), BTreeMap::from([(1, f(&[0, 1]))]));

    let req = RegionRequirement::new(s.root, s.root, RegionUsage::read_only(), f(&[0, 1, 2]));
    let info = analyze(&s.runtime, 1, &req);
    assert_eq!(info.field_versions(0), BTreeMap::from([(1, f(&[0, 1, 2]))]));
    let phys = info.physical_state(0).unwrap();
    assert_eq!(phys.valid_views, BTreeMap::from([(ViewId(3), f(&[0, 1]))]));
    assert_eq!(phys.dirty_mask, f(&[0, 1]));

    // Fields that already have versions are left alone.
    let late = BTreeMap::from([(ViewId(9), f(&[0]))]);
    s.runtime.initialize_version_state(CTX, s.root, f(&[0]), &late).unwrap();
    let again = analyze(&s.runtime, 2, &req);
    assert_eq!(again.physical_state(0).unwrap().valid_views, phys.valid_views);
}

#[test]
fn path_nodes_split_fields_their_launch_already_advanced() {
    let s = setup();
    let mut projection = ProjectionInfo::new(ProjectionFunction::Identity, Domain::new(0, 3));
    projection.record_projection_epoch(FIRST_EPOCH, f(&[0]));

    let at_root = RegionRequirement::new(s.root, s.root, RegionUsage::read_write(), f(&[0]))
        .with_projection(projection.clone());
    analyze(&s.runtime, 9, &at_root);

    let below = RegionRequirement::new(s.root, s.subregions[0], RegionUsage::read_write(), f(&[0]))
        .with_projection(projection);
    let info = analyze(&s.runtime, 9, &below);

    // The root was advanced by the same launch: read what it replaced and
    // keep the new version as the one written.
    assert_eq!(info.split_mask(0), f(&[0]));
    assert!(info.physical_state(0).is_some_and(|p| p.path_only));
    assert_eq!(info.field_versions(0), BTreeMap::from([(1, f(&[0]))]));
    let mut written = BTreeMap::new();
    info.get_advance_versions(0, f(&[0]), &mut written);
    assert_eq!(written, BTreeMap::from([(2, f(&[0]))]));

    // Nothing below the root was advanced before.
    assert!(info.split_mask(1).is_empty());
    assert_eq!(info.field_versions(1), BTreeMap::from([(1, f(&[0]))]));
    let root = s.runtime.version_manager(s.root, CTX).unwrap();
    assert_eq!(root.current_versions(), BTreeMap::from([(2, f(&[0]))]));
}

// =============================================================================
// Idempotent advance
// =============================================================================

#[test]
fn repeated_advance_in_one_epoch_is_a_duplicate() {
    let s = setup();
    let services = s.runtime.services();
    let manager = s.runtime.manager(s.root, CTX);
    manager.materialize_unversioned(services, f(&[0, 1])).unwrap();

    let mut args = AdvanceArgs::new(f(&[0, 1]), UniqueId(7));
    args.dedup_advances = true;
    args.advance_epoch = 1;
    let first = s.runtime.advance_version_numbers(CTX, s.root, args).unwrap();
    assert!(matches!(first, AdvanceOutcome::Advanced { .. }));
    let current = manager.current_versions();
    let previous = manager.previous_versions();
    assert_eq!(current, BTreeMap::from([(2, f(&[0, 1]))]));

    let second = s.runtime.advance_version_numbers(CTX, s.root, args).unwrap();
    assert!(matches!(second, AdvanceOutcome::Duplicate));
    assert_eq!(manager.current_versions(), current);
    assert_eq!(manager.previous_versions(), previous);

    // A later epoch of the same context advances again.
    args.advance_epoch = 2;
    let third = s.runtime.advance_version_numbers(CTX, s.root, args).unwrap();
    assert!(matches!(third, AdvanceOutcome::Advanced { .. }));
    assert_eq!(manager.current_versions(), BTreeMap::from([(3, f(&[0, 1]))]));
}

#[test]
fn later_epochs_retire_dedup_entries() {
    let s = setup();
    let manager = s.runtime.manager(s.root, CTX);
    for epoch in 1..=5u64 {
        let mut args = AdvanceArgs::new(f(&[0, 1]), UniqueId(epoch));
        args.dedup_advances = true;
        args.advance_epoch = epoch;
        s.runtime.advance_version_numbers(CTX, s.root, args).unwrap();
        assert_eq!(manager.recorded_epochs(), 1);
    }
    assert_eq!(manager.current_versions(), BTreeMap::from([(6, f(&[0, 1]))]));

    // A later epoch covering one field keeps the older entry for the other.
    let mut args = AdvanceArgs::new(f(&[0]), UniqueId(9));
    args.dedup_advances = true;
    args.advance_epoch = 6;
    s.runtime.advance_version_numbers(CTX, s.root, args).unwrap();
    assert_eq!(manager.recorded_epochs(), 2);
    assert_eq!(manager.current_versions(), BTreeMap::from([(6, f(&[1])), (7, f(&[0]))]));

    // Until that field moves on too.
    let mut args = AdvanceArgs::new(f(&[1]), UniqueId(9));
    args.dedup_advances = true;
    args.advance_epoch = 6;
    s.runtime.advance_version_numbers(CTX, s.root, args).unwrap();
    assert_eq!(manager.recorded_epochs(), 1);
}

#[test]
fn points_of_one_index_launch_share_an_advance() {
    let s = setup();
    let mut req = RegionRequirement::new(s.root, s.partition, RegionUsage::read_write(), f(&[0]))
        .with_projection(ProjectionInfo::new(ProjectionFunction::Identity, Domain::new(0, 3)));
    s.runtime.register_logical_user(CTX, OpRef::new(1, 0), 0, &mut req).unwrap();

    let a = analyze(&s.runtime, 9, &req);
    let b = analyze(&s.runtime, 9, &req);

    let manager = s.runtime.version_manager(s.partition, CTX).unwrap();
    assert_eq!(manager.current_versions(), BTreeMap::from([(2, f(&[0]))]));
    for info in [&a, &b] {
        let mut read = BTreeMap::new();
        info.get_field_versions(1, true, f(&[0]), &mut read);
        assert_eq!(read, BTreeMap::from([(1, f(&[0]))]));
        let mut written = BTreeMap::new();
        info.get_advance_versions(1, f(&[0]), &mut written);
        assert_eq!(written, BTreeMap::from([(2, f(&[0]))]));
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn every_field_has_one_current_version(accesses in prop::collection::vec(arbitrary_access(), 1..32)) {
        let s = setup();
        let mut model: BTreeMap<(NodeId, FieldId), VersionId> = BTreeMap::new();

        for (i, access) in accesses.iter().enumerate() {
            let mask = FieldMask::from_bits(access.fields);
            let (target, path) = match access.child {
                Some(c) => (s.subregions[c], vec![s.root, s.partition]),
                None => (s.root, vec![]),
            };
            let usage = if access.write { RegionUsage::read_write() } else { RegionUsage::read_only() };
            let req = RegionRequirement::new(s.root, target, usage, mask);
            let info = analyze(&s.runtime, i as u64 + 1, &req);

            for field in mask.iter() {
                for node in &path {
                    let v = model.entry((*node, field)).or_insert(1);
                    *v = (*v).max(1);
                }
                let v = model.entry((target, field)).or_insert(0);
                *v = (*v).max(1) + VersionId::from(access.write);
            }
            if !access.write {
                let depth = path.len() as u32;
                let expected: BTreeMap<VersionId, FieldMask> = group(&model, target)
                    .into_iter()
                    .map(|(v, m)| (v, m & mask))
                    .filter(|(_, m)| !m.is_empty())
                    .collect();
                prop_assert_eq!(info.field_versions(depth), expected);
            }
        }

        let mut nodes = vec![s.root, s.partition];
        nodes.extend(s.subregions.iter().copied());
        for node in nodes {
            let expected = group(&model, node);
            match s.runtime.version_manager(node, CTX) {
                Some(manager) => {
                    prop_assert!(manager.sanity_check());
                    prop_assert_eq!(manager.current_versions(), expected);
                }
                None => prop_assert!(expected.is_empty()),
            }
        }
    }

    #[test]
    fn packed_infos_unpack_to_the_same_versions(accesses in prop::collection::vec(arbitrary_access(), 1..12)) {
        let s = setup();
        let mut last = VersionInfo::new();
        for (i, access) in accesses.iter().enumerate() {
            let target = access.child.map_or(s.root, |c| s.subregions[c]);
            let usage = if access.write { RegionUsage::read_write() } else { RegionUsage::read_only() };
            let req = RegionRequirement::new(s.root, target, usage, FieldMask::from_bits(access.fields));
            last = analyze(&s.runtime, i as u64 + 1, &req);
        }

        let bytes = last.pack().unwrap();
        let (unpacked, remote) = VersionInfo::unpack(&bytes, &s.runtime.services().arena).unwrap();
        prop_assert!(remote.is_empty());
        prop_assert_eq!(unpacked.pack_version_info(), last.pack_version_info());
        let deepest = last.max_depth().unwrap();
        prop_assert_eq!(unpacked.max_depth(), Some(deepest));
        for depth in 0..=deepest {
            prop_assert_eq!(unpacked.field_versions(depth), last.field_versions(depth));
            prop_assert_eq!(unpacked.split_mask(depth), last.split_mask(depth));
        }

        let numbers = VersionInfo::unpack_version_numbers(&last.pack_version_numbers());
        for depth in 0..=deepest {
            prop_assert_eq!(numbers.field_versions(depth), last.field_versions(depth));
        }
    }
}
