use criterion::{black_box, criterion_group, criterion_main, Criterion, BenchmarkId, Throughput};
use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tx2_replication::{
    compress_quaternion, decompress_quaternion,
    Channel, ConnectionRegistry, InterestConfig, InterestManagement, MemoryTransport, MessageHeader,
    MessageSender, NetId, NetworkEntity, NetworkReader, NetworkWriter, PrefabId, SpawnMessage,
    TransformMessage, World,
};

fn random_rotation(rng: &mut StdRng) -> Quat {
    Quat::from_xyzw(
        rng.random_range(-1.0..1.0),
        rng.random_range(-1.0..1.0),
        rng.random_range(-1.0..1.0),
        rng.random_range(-1.0..1.0),
    )
    .normalize()
}

fn create_transforms(count: usize) -> Vec<TransformMessage> {
    let mut rng = StdRng::seed_from_u64(7);

    (0..count)
        .map(|i| TransformMessage {
            net_id: NetId(i as u64 + 1),
            position: Vec3::new(rng.random_range(-500.0..500.0), 0.0, rng.random_range(-500.0..500.0)),
            rotation: compress_quaternion(random_rotation(&mut rng)),
        })
        .collect()
}

fn benchmark_codec(c: &mut Criterion) {
    let messages = create_transforms(40);
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(messages.len() as u64));

    group.bench_function("write_transform_frame", |b| {
        let mut writer = NetworkWriter::with_capacity(1200);
        b.iter(|| {
            writer.reset();
            writer.write_header(MessageHeader::new(0x0025, messages.len() as u32));
            for message in &messages {
                writer.write(black_box(message));
            }
            black_box(writer.position());
        });
    });

    let mut writer = NetworkWriter::with_capacity(1200);
    writer.write_header(MessageHeader::new(0x0025, messages.len() as u32));
    for message in &messages {
        writer.write(message);
    }
    let frame = writer.as_bytes().to_vec();

    group.bench_function("read_transform_frame", |b| {
        b.iter(|| {
            let mut reader = NetworkReader::new(black_box(&frame));
            let header = reader.read_header().unwrap();
            for _ in 0..header.count {
                black_box(reader.read::<TransformMessage>().unwrap());
            }
        });
    });

    group.finish();
}

fn benchmark_quaternion(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(11);
    let rotations: Vec<Quat> = (0..1000).map(|_| random_rotation(&mut rng)).collect();
    let compressed: Vec<u32> = rotations.iter().map(|q| compress_quaternion(*q)).collect();

    let mut group = c.benchmark_group("quaternion");
    group.throughput(Throughput::Elements(rotations.len() as u64));

    group.bench_function("compress", |b| {
        b.iter(|| {
            for rotation in &rotations {
                black_box(compress_quaternion(black_box(*rotation)));
            }
        });
    });

    group.bench_function("decompress", |b| {
        b.iter(|| {
            for data in &compressed {
                black_box(decompress_quaternion(black_box(*data)));
            }
        });
    });

    group.finish();
}

fn create_scene(entity_count: usize, connection_count: u32) -> (World, ConnectionRegistry) {
    let mut rng = StdRng::seed_from_u64(3);
    let mut world = World::new();
    let mut registry = ConnectionRegistry::new(connection_count as usize);

    for connection_id in 1..=connection_count {
        registry.add(connection_id, true).unwrap();
    }

    for i in 0..entity_count {
        let position = Vec3::new(rng.random_range(-200.0..200.0), 0.0, rng.random_range(-200.0..200.0));
        let key = world.insert(NetworkEntity::new(PrefabId::from_u128(1), position, Quat::IDENTITY));
        let entity = world.get_mut(key).unwrap();
        entity.net_id = key.to_net_id();

        if (i as u32) < connection_count {
            let owner = i as u32 + 1;
            entity.connection_id = Some(owner);
            registry.get_mut(owner).unwrap().owned_entities.insert(key);
        }
    }

    (world, registry)
}

fn benchmark_interest_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("interest_rebuild");

    for entity_count in [1_000, 5_000, 10_000] {
        let (mut world, mut registry) = create_scene(entity_count, 100);
        let mut sender = MessageSender::new(MemoryTransport::new(1200), 1200);
        let mut interest = InterestManagement::new(&InterestConfig::default());

        // Warm up so iterations measure steady-state rebuilds.
        interest.rebuild_now(0.0, &mut world, &mut registry, &mut sender);
        sender.transport_mut().take_sent();

        group.throughput(Throughput::Elements(entity_count as u64));
        group.bench_with_input(BenchmarkId::new("full_rebuild", entity_count), &entity_count, |b, _| {
            b.iter(|| {
                interest.rebuild_now(0.0, &mut world, &mut registry, &mut sender);
                sender.transport_mut().take_sent();
            });
        });
    }

    group.finish();
}

fn benchmark_batched_dispatch(c: &mut Criterion) {
    let spawns: Vec<SpawnMessage> = (0..500)
        .map(|i| SpawnMessage {
            prefab_id: PrefabId::from_u128(1),
            net_id: NetId(i + 1),
            owned: false,
            position: Vec3::ZERO,
            rotation: 0,
        })
        .collect();

    let mut group = c.benchmark_group("batched_dispatch");
    group.throughput(Throughput::Elements(spawns.len() as u64));

    for capacity in [256, 1200] {
        group.bench_with_input(BenchmarkId::new("send_spawns", capacity), &capacity, |b, &capacity| {
            let mut registry = ConnectionRegistry::new(1);
            registry.add(1, true).unwrap();
            let mut sender = MessageSender::new(MemoryTransport::new(capacity), capacity);

            b.iter(|| {
                let connection = registry.get_mut(1).unwrap();
                black_box(sender.send_batch(connection, &spawns, Channel::Reliable).unwrap());
                sender.transport_mut().take_sent();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_codec,
    benchmark_quaternion,
    benchmark_interest_rebuild,
    benchmark_batched_dispatch,
);
criterion_main!(benches);
