use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use scanfit_core::{
    align::Aligner,
    features::{Orb, OrbParams, match_descriptors},
    geometry::{PageRegion, RoiWindow, ScanLayout},
};
use scanfit_utils::{
    AlignmentSettings,
    synthetic::{place_page, textured_page},
};

const PAGE: (u32, u32) = (495, 475);

fn layout() -> ScanLayout {
    ScanLayout::new(
        PageRegion {
            left: 0,
            top: 0,
            width: PAGE.0,
            height: PAGE.1,
        },
        RoiWindow {
            left: 215,
            top: 290,
            width: 125,
            height: 100,
        },
    )
}

fn benchmark_alignment(c: &mut Criterion) {
    let content = textured_page(PAGE.0 + 40, PAGE.1 + 40, 42);
    let reference = place_page(&content, PAGE.0, PAGE.1, -20, -20, 0, 0);
    let moved = place_page(&content, PAGE.0, PAGE.1, -20, -20, 9, -6);

    let mut group = c.benchmark_group("orb");
    for max_features in [250usize, 500, 1000] {
        let orb = Orb::new(OrbParams {
            max_features,
            ..OrbParams::default()
        });
        group.bench_with_input(
            BenchmarkId::new("detect_and_compute", max_features),
            &orb,
            |b, orb| b.iter(|| orb.detect_and_compute(black_box(&moved))),
        );
        let a = orb.detect_and_compute(&reference);
        let t = orb.detect_and_compute(&moved);
        group.bench_with_input(
            BenchmarkId::new("match_cross_check", max_features),
            &(a, t),
            |b, (a, t)| b.iter(|| match_descriptors(black_box(&a.descriptors), &t.descriptors, true)),
        );
    }
    group.finish();

    let settings = AlignmentSettings::default();
    let aligner = Aligner::new(&reference, &settings, layout());
    c.bench_function("align_page", |b| b.iter(|| aligner.align(black_box(&moved))));
}

criterion_group!(benches, benchmark_alignment);
criterion_main!(benches);
