use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lsph::{BuildConf, Function, Mphf};

fn splitmix(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn keys(n: usize) -> Vec<String> {
    let mut state = 0xBE;
    (0..n).map(|_| format!("{:016x}", splitmix(&mut state))).collect()
}

fn bench_build(c: &mut Criterion) {
    let keys = keys(100_000);
    let values: Vec<u64> = (0..keys.len() as u64).collect();
    c.bench_function("build function 100k", |b| {
        b.iter(|| Function::try_with_conf(&keys, &values, BuildConf::default()).unwrap())
    });
    c.bench_function("build mphf 100k", |b| {
        b.iter(|| Mphf::try_with_conf(&keys, 0, BuildConf::default()).unwrap())
    });
}

fn bench_get(c: &mut Criterion) {
    let keys = keys(100_000);
    let values: Vec<u64> = (0..keys.len() as u64).collect();
    let f = Function::try_with_conf(&keys, &values, BuildConf::default()).unwrap();
    let m = Mphf::try_with_conf(&keys, 0, BuildConf::default()).unwrap();
    let mut i = 0;
    c.bench_function("function get", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(f.get(keys[i].as_str()))
        })
    });
    c.bench_function("mphf get", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(m.get(keys[i].as_str()))
        })
    });
}

criterion_group!(benches, bench_build, bench_get);
criterion_main!(benches);
