//! Logical dependence analysis through the runtime.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use stratum::Config;
use stratum::Runtime;
use stratum::logical::RegionRequirement;
use stratum::logical::closer::CloseKind;
use stratum::logical::field_state::OpenState;
use stratum::logical::projection::Domain;
use stratum::logical::projection::ProjectionFunction;
use stratum::logical::projection::ProjectionInfo;
use stratum::primitives::AddressSpace;
use stratum::primitives::ContextId;
use stratum::primitives::DependenceType;
use stratum::primitives::FieldMask;
use stratum::primitives::NodeId;
use stratum::primitives::OpRef;
use stratum::primitives::RegionForest;
use stratum::primitives::RegionUsage;
use stratum::transport::DeliveryMode;
use stratum::transport::LocalNetwork;
use stratum::version::OwnerDirectory;

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

fn setup(disjoint: bool, count: u32) -> Setup {
    let forest = Arc::new(RegionForest::new());
    let root = forest.create_region();
    let (partition, subregions) = forest.create_partition_with(root, 0, disjoint, count);
    let network = LocalNetwork::new(DeliveryMode::Inline);
    let runtime = Runtime::new(AddressSpace(0), Config::default(), forest, network.clone(), Arc::new(OwnerDirectory::new()));
    network.attach(&runtime);
    return Setup { runtime, root, partition, subregions };
}

fn f(fields: &[u32]) -> FieldMask {
    return FieldMask::from_fields(fields);
}

fn op(id: u64) -> OpRef {
    return OpRef::new(id, 0);
}

fn projection(lo: i64, hi: i64) -> ProjectionInfo {
    return ProjectionInfo::new(ProjectionFunction::Identity, Domain::new(lo, hi));
}

// =============================================================================
// Three-operation scenario
// =============================================================================

#[test]
fn write_read_write_on_one_region() {
    let s = setup(true, 2);
    let rt = &s.runtime;

    let mut o1 = RegionRequirement::new(s.root, s.root, RegionUsage::read_write(), f(&[0, 1]));
    let first = rt.register_logical_user(CTX, op(1), 0, &mut o1).unwrap();
    assert!(first.dependences.is_empty());

    let mut o2 = RegionRequirement::new(s.root, s.root, RegionUsage::read_only(), f(&[0]));
    let second = rt.register_logical_user(CTX, op(2), 0, &mut o2).unwrap();
    assert!(second.closes.is_empty());
    assert_eq!(second.dependences.len(), 1);
    assert_eq!(second.dependences[0].prev, op(1));
    assert_eq!(second.dependences[0].kind, DependenceType::True);
    assert_eq!(second.dependences[0].mask, f(&[0]));

    let mut o3 = RegionRequirement::new(s.root, s.root, RegionUsage::read_write(), f(&[1]));
    let third = rt.register_logical_user(CTX, op(3), 0, &mut o3).unwrap();
    assert!(third.closes.is_empty());
    assert_eq!(third.predecessors(), vec![op(1)]);
    assert_eq!(third.dependences[0].mask, f(&[1]));

    let handle = rt.logical_state(s.root, CTX).unwrap();
    let state = handle.lock();
    let current: Vec<(OpRef, FieldMask, bool)> =
        state.curr_epoch_users.iter().map(|u| (u.op, u.mask, u.usage.is_read_only())).collect();
    assert_eq!(current, vec![(op(2), f(&[0]), true), (op(3), f(&[1]), false)]);
    assert!(state.prev_epoch_users.iter().all(|u| u.op == op(1)));
}

#[test]
fn scenario_through_a_subregion_keeps_the_path_open() {
    let s = setup(true, 2);
    let rt = &s.runtime;
    let target = s.subregions[0];

    let mut o1 = RegionRequirement::new(s.root, target, RegionUsage::read_write(), f(&[0, 1]));
    rt.register_logical_user(CTX, op(1), 0, &mut o1).unwrap();
    let mut o2 = RegionRequirement::new(s.root, target, RegionUsage::read_only(), f(&[0]));
    let second = rt.register_logical_user(CTX, op(2), 0, &mut o2).unwrap();
    let mut o3 = RegionRequirement::new(s.root, target, RegionUsage::read_write(), f(&[1]));
    let third = rt.register_logical_user(CTX, op(3), 0, &mut o3).unwrap();

    assert!(second.closes.is_empty());
    assert!(third.closes.is_empty());
    assert_eq!(second.predecessors(), vec![op(1)]);
    assert_eq!(third.predecessors(), vec![op(1)]);

    let handle = rt.logical_state(s.root, CTX).unwrap();
    let root = handle.lock();
    assert_eq!(root.open_fields(), f(&[0, 1]));
    assert!(root.field_states.iter().all(|state| state.open_children.keys().all(|color| *color == 0)));
}

#[test]
fn sibling_writes_close_the_previous_child() {
    let s = setup(false, 2);
    let rt = &s.runtime;

    let mut left = RegionRequirement::new(s.root, s.subregions[0], RegionUsage::read_write(), f(&[0]));
    rt.register_logical_user(CTX, op(1), 0, &mut left).unwrap();
    let mut right = RegionRequirement::new(s.root, s.subregions[1], RegionUsage::read_write(), f(&[0]));
    let outcome = rt.register_logical_user(CTX, op(2), 0, &mut right).unwrap();

    assert_eq!(outcome.closes.len(), 1);
    let close = &outcome.closes[0];
    assert_eq!(close.kind, CloseKind::Normal);
    assert_eq!(close.node, s.partition);
    assert_eq!(close.mask, f(&[0]));
    assert!(outcome.predecessors().contains(&close.op));
}

#[test]
fn disjoint_siblings_stay_open() {
    let s = setup(true, 2);
    let rt = &s.runtime;
    let mut left = RegionRequirement::new(s.root, s.subregions[0], RegionUsage::read_write(), f(&[0]));
    rt.register_logical_user(CTX, op(1), 0, &mut left).unwrap();
    let mut right = RegionRequirement::new(s.root, s.subregions[1], RegionUsage::read_write(), f(&[0]));
    let outcome = rt.register_logical_user(CTX, op(2), 0, &mut right).unwrap();
    assert!(outcome.closes.is_empty());
    assert!(outcome.dependences.is_empty());
}

// =============================================================================
// Elision
// =============================================================================

#[test]
fn disjoint_projections_elide_the_close() {
    let s = setup(true, 8);
    let rt = &s.runtime;

    let mut a = RegionRequirement::new(s.root, s.partition, RegionUsage::read_write(), f(&[0]))
        .with_projection(projection(0, 3));
    rt.register_logical_user(CTX, op(1), 0, &mut a).unwrap();

    let mut b = RegionRequirement::new(s.root, s.partition, RegionUsage::read_write(), f(&[0]))
        .with_projection(projection(4, 7));
    let outcome = rt.register_logical_user(CTX, op(2), 0, &mut b).unwrap();
    assert!(outcome.closes.is_empty());

    let handle = rt.logical_state(s.partition, CTX).unwrap();
    assert_eq!(handle.lock().open_state_of(0), Some(OpenState::ReadWriteProjDisjointShallow));
}

#[test]
fn overlapping_projections_are_closed() {
    let s = setup(true, 8);
    let rt = &s.runtime;

    let mut a = RegionRequirement::new(s.root, s.partition, RegionUsage::read_write(), f(&[0]))
        .with_projection(projection(0, 3));
    rt.register_logical_user(CTX, op(1), 0, &mut a).unwrap();

    let mut b = RegionRequirement::new(s.root, s.partition, RegionUsage::read_write(), f(&[0]))
        .with_projection(projection(2, 5));
    let outcome = rt.register_logical_user(CTX, op(2), 0, &mut b).unwrap();
    assert_eq!(outcome.closes.len(), 1);
    assert_eq!(outcome.closes[0].closed_projections, f(&[0]));
}

#[test]
fn elision_can_be_disabled() {
    let forest = Arc::new(RegionForest::new());
    let root = forest.create_region();
    let (partition, _) = forest.create_partition_with(root, 0, true, 8);
    let network = LocalNetwork::new(DeliveryMode::Inline);
    let config = Config { enable_close_elision: false, ..Config::default() };
    let rt = Runtime::new(AddressSpace(0), config, forest, network.clone(), Arc::new(OwnerDirectory::new()));
    network.attach(&rt);

    let mut a = RegionRequirement::new(root, partition, RegionUsage::read_write(), f(&[0])).with_projection(projection(0, 3));
    rt.register_logical_user(CTX, op(1), 0, &mut a).unwrap();
    let mut b = RegionRequirement::new(root, partition, RegionUsage::read_write(), f(&[0])).with_projection(projection(4, 7));
    let outcome = rt.register_logical_user(CTX, op(2), 0, &mut b).unwrap();
    assert_eq!(outcome.closes.len(), 1);
}

#[test]
fn commits_are_forgotten_once_no_user_refers_to_them() {
    let s = setup(true, 2);
    let rt = &s.runtime;
    for id in 1..=200 {
        let mut req = RegionRequirement::new(s.root, s.root, RegionUsage::read_write(), f(&[0]));
        let outcome = rt.register_logical_user(CTX, op(id), 0, &mut req).unwrap();
        assert!(outcome.dependences.is_empty());
        rt.commit_operation(op(id));
    }
    // Every 63 commits past the last sweep, committing sweeps again.
    assert_eq!(rt.services().commits.len(), 11);

    assert_eq!(rt.retire_commits(), 10);
    assert_eq!(rt.services().commits.len(), 1);
    assert!(rt.services().commits.is_committed(op(200)));

    // The surviving user is still pruned rather than depended on.
    let mut read = RegionRequirement::new(s.root, s.root, RegionUsage::read_only(), f(&[0]));
    let outcome = rt.register_logical_user(CTX, op(201), 0, &mut read).unwrap();
    assert!(outcome.dependences.is_empty());
}

// =============================================================================
// Close boundedness
// =============================================================================

#[derive(Clone, Debug)]
struct Access {
    child: Option<u32>,
    usage: u8,
    fields: u64,
}

fn arbitrary_access() -> impl Strategy<Value = Access> {
    return (prop::option::of(0u32..6), 0u8..4, 1u64..16).prop_map(|(child, usage, fields)| Access { child, usage, fields });
}

fn usage_of(kind: u8) -> RegionUsage {
    match kind {
        0 => return RegionUsage::read_only(),
        1 => return RegionUsage::read_write(),
        2 => return RegionUsage::write_discard(),
        _ => return RegionUsage::reduce(1),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn at_most_one_close_per_category(accesses in prop::collection::vec(arbitrary_access(), 1..24), disjoint in any::<bool>()) {
        let s = setup(disjoint, 6);
        for (i, access) in accesses.iter().enumerate() {
            let target = match access.child {
                Some(c) => s.subregions[c as usize],
                None => s.root,
            };
            let mut req = RegionRequirement::new(s.root, target, usage_of(access.usage), FieldMask::from_bits(access.fields));
            let outcome = s.runtime.register_logical_user(CTX, op(i as u64 + 1), 0, &mut req).unwrap();
            let mut seen = BTreeSet::new();
            for close in &outcome.closes {
                prop_assert!(seen.insert((close.node, close.kind)), "two {:?} closes at {:?}", close.kind, close.node);
                prop_assert!(!close.mask.is_empty());
            }
            let per_node = outcome.closes.iter().map(|c| c.node).collect::<BTreeSet<_>>();
            for node in per_node {
                prop_assert!(outcome.closes.iter().filter(|c| c.node == node).count() <= CloseKind::ALL.len());
            }
        }
    }
}
