use criterion::{black_box, criterion_group, criterion_main, Criterion};

use modulith::{
    make_container, MutProvider, OwnerRefBox, SharedProvider, SharedRefBox, TypeFactory, TypeKey,
};

fn bench_container_resolution(c: &mut Criterion) {
    let container = make_container(Vec::new(), None);
    container
        .registry()
        .add_factory(TypeKey::of::<u64>(), TypeFactory::from_instance(42u64));
    container
        .registry()
        .add_factory(TypeKey::of::<String>(), TypeFactory::from_ctor(String::new));

    c.bench_function("container_get_cached", |b| {
        b.iter(|| black_box(container.get::<u64>()))
    });

    c.bench_function("container_get_ctor", |b| {
        b.iter(|| black_box(container.get::<String>()))
    });

    let step = container
        .descend(Vec::new(), Some(modulith::Lifetime::Step))
        .unwrap();
    c.bench_function("container_get_through_parent_chain", |b| {
        b.iter(|| black_box(step.get::<String>()))
    });
}

fn bench_provider_ops(c: &mut Criterion) {
    let shared = SharedRefBox::new(|| Some(7u64));
    c.bench_function("shared_borrow_reclaim", |b| {
        b.iter(|| {
            let v = shared.borrow().unwrap();
            shared.reclaim(black_box(v));
        })
    });

    let owner = OwnerRefBox::new(|| Some(7u64), || Some(9u64));
    c.bench_function("owner_acquire_release", |b| {
        b.iter(|| {
            let v = owner.acquire().unwrap();
            owner.release(black_box(v));
        })
    });
}

criterion_group!(benches, bench_container_resolution, bench_provider_ops);
criterion_main!(benches);
