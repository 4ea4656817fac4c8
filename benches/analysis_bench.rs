// Benchmarks for the dependence and versioning analysis hot paths.
//
// - register_logical_user over a partitioned region with mixed privileges
// - projection requirements that either elide or force closes
// - single-space versioning analysis for reads and writes

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stratum::Config;
use stratum::Runtime;
use stratum::logical::RegionRequirement;
use stratum::logical::projection::Domain;
use stratum::logical::projection::ProjectionFunction;
use stratum::logical::projection::ProjectionInfo;
use stratum::primitives::AddressSpace;
use stratum::primitives::ContextId;
use stratum::primitives::FieldMask;
use stratum::primitives::NodeId;
use stratum::primitives::OpRef;
use stratum::primitives::RegionForest;
use stratum::primitives::RegionUsage;
use stratum::primitives::UniqueId;
use stratum::transport::DeliveryMode;
use stratum::transport::LocalNetwork;
use stratum::version::OwnerDirectory;
use stratum::version::VersionInfo;

const CTX: ContextId = ContextId(0);

// =============================================================================
// Benchmark Helpers
// =============================================================================

struct Bench {
    runtime: Arc<Runtime>,
    root: NodeId,
    partition: NodeId,
    subregions: Vec<NodeId>,
}

fn setup(disjoint: bool, count: u32) -> Bench {
    let forest = Arc::new(RegionForest::new());
    let root = forest.create_region();
    let (partition, subregions) = forest.create_partition_with(root, 0, disjoint, count);
    let network = LocalNetwork::new(DeliveryMode::Inline);
    let runtime = Runtime::new(AddressSpace(0), Config::default(), forest, network.clone(), Arc::new(OwnerDirectory::new()));
    network.attach(&runtime);
    return Bench { runtime, root, partition, subregions };
}

/// Random requirements against the root or one of its subregions.
fn random_requirements(bench: &Bench, count: usize, seed: u64) -> Vec<RegionRequirement> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let target = if rng.gen_bool(0.2) {
            bench.root
        } else {
            bench.subregions[rng.gen_range(0..bench.subregions.len())]
        };
        let usage = if rng.gen_bool(0.5) { RegionUsage::read_only() } else { RegionUsage::read_write() };
        let fields = FieldMask::from_bits(rng.gen_range(1u64..256));
        out.push(RegionRequirement::new(bench.root, target, usage, fields));
    }
    return out;
}

// =============================================================================
// Logical analysis
// =============================================================================

fn bench_register_logical_user(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_logical_user");

    for &disjoint in &[true, false] {
        for &ops in &[100usize, 1000] {
            let label = if disjoint { "disjoint" } else { "aliased" };
            group.bench_with_input(BenchmarkId::new(label, ops), &ops, |b, &ops| {
                b.iter(|| {
                    let bench = setup(disjoint, 16);
                    let mut reqs = random_requirements(&bench, ops, 42);
                    for (i, req) in reqs.iter_mut().enumerate() {
                        let outcome = bench.runtime.register_logical_user(CTX, OpRef::new(i as u64 + 1, 0), 0, req);
                        black_box(outcome.ok());
                    }
                });
            });
        }
    }

    group.finish();
}

fn bench_projection_elision(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_elision");

    // Alternating halves of the color space never overlap; shifted windows always do.
    for &(label, shift) in &[("disjoint", 32i64), ("overlapping", 16i64)] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let bench = setup(true, 64);
                for i in 0..200u64 {
                    let lo = if i % 2 == 0 { 0 } else { shift };
                    let domain = Domain::new(lo, lo + 31);
                    let mut req = RegionRequirement::new(bench.root, bench.partition, RegionUsage::read_write(), FieldMask::from_fields(&[0]))
                        .with_projection(ProjectionInfo::new(ProjectionFunction::Identity, domain));
                    let outcome = bench.runtime.register_logical_user(CTX, OpRef::new(i + 1, 0), 0, &mut req);
                    black_box(outcome.ok());
                }
            });
        });
    }

    group.finish();
}

// =============================================================================
// Versioning analysis
// =============================================================================

fn bench_versioning_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("versioning_analysis");

    for &ops in &[100usize, 500] {
        group.bench_with_input(BenchmarkId::new("mixed", ops), &ops, |b, &ops| {
            b.iter(|| {
                let bench = setup(true, 16);
                let reqs = random_requirements(&bench, ops, 7);
                for (i, req) in reqs.iter().enumerate() {
                    let mut info = VersionInfo::new();
                    if let Ok(ready) = bench.runtime.perform_versioning_analysis(CTX, UniqueId(i as u64 + 1), req, &mut info) {
                        ready.wait();
                        info.capture_physical_states();
                    }
                    black_box(&info);
                }
            });
        });
    }

    group.finish();
}

fn bench_pack_version_info(c: &mut Criterion) {
    let bench = setup(true, 16);
    let reqs = random_requirements(&bench, 64, 11);
    let mut infos: Vec<VersionInfo> = reqs
        .iter()
        .enumerate()
        .map(|(i, req)| {
            let mut info = VersionInfo::new();
            if let Ok(ready) = bench.runtime.perform_versioning_analysis(CTX, UniqueId(i as u64 + 1), req, &mut info) {
                ready.wait();
                info.capture_physical_states();
            }
            return info;
        })
        .collect();
    let info = infos.pop().unwrap_or_default();

    c.bench_function("pack_version_info", |b| {
        b.iter(|| black_box(info.pack_version_info()));
    });
}

criterion_group!(
    benches,
    bench_register_logical_user,
    bench_projection_elision,
    bench_versioning_analysis,
    bench_pack_version_info,
);
criterion_main!(benches);
