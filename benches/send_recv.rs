// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Send/receive/reclaim throughput over in-process shared memory.
//
// Groups:
//   send_slot       — AcquireSlot + SendSlot, one connected receiver
//   round_trip      — full Server -> Client -> ReleaseSlot -> ReclaimSlots loop
//   class_saturated — SendSlot with a zero-limit class and no connected
//                     receiver, exercising the immediate-return-to-Free path
//
// Each group is parameterized by slot_content_size, since the guard-table
// layout and the memcpy-shaped access both scale with it.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use memcon::{Client, ClientBuilder, InProcessSideChannel, MemoryTechnology, Server, ServerBuilder};

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_512", 512), ("large_4096", 4096)];

fn build_connected_pair(content_size: usize, num_slots: usize) -> (Server, Client) {
    let server = ServerBuilder::new()
        .number_slots(num_slots)
        .slot_content_size(content_size)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_number_receivers(1)
        .number_classes(1)
        .class(num_slots as u32)
        .on_receiver_state_transition_callback(|_, _, _| {})
        .build()
        .expect("server build");

    let class = server.class_handle(0);
    let id = server.add_receiver(class).expect("add_receiver");
    let (server_channel, client_channel) = InProcessSideChannel::pair();
    server.connect_receiver(id, Box::new(server_channel)).expect("connect_receiver");

    let client = ClientBuilder::new()
        .slot_content_size(content_size)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_outstanding_slots(num_slots)
        .side_channel(Box::new(client_channel))
        .on_state_transition_callback(|_, _| {})
        .build();

    client.poll_reactor();
    server.poll_reactor();
    (server, client)
}

fn bench_send_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_slot");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let (server, client) = build_connected_pair(sz, 64);
            b.iter(|| {
                let token = server.acquire_slot().expect("slots exhausted");
                server.access_slot_content(&token, |bytes| bytes.fill(0xAB));
                let dropped = server.send_slot(token);
                black_box(dropped.classes.len());

                // Drain so the next iteration has a free slot again.
                let index = client.try_receive_slot().expect("delivered");
                client.release_slot(index);
                server.reclaim_slots().expect("no corruption");
            });
        });
    }

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let (server, client) = build_connected_pair(sz, 64);
            b.iter(|| {
                let token = server.acquire_slot().unwrap();
                server.access_slot_content(&token, |bytes| bytes.fill(0x5A));
                server.send_slot(token);

                let index = client.try_receive_slot().expect("delivered");
                client.access_slot_content(index, |bytes| black_box(bytes[0]));
                assert!(client.release_slot(index));
                server.reclaim_slots().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_class_saturated(c: &mut Criterion) {
    let mut group = c.benchmark_group("class_saturated");
    group.throughput(Throughput::Elements(1));

    group.bench_function("drop_path", |b| {
        let server = ServerBuilder::new()
            .number_slots(4)
            .slot_content_size(64)
            .slot_content_alignment(8)
            .memory_technology(MemoryTechnology::InProcess)
            .max_number_receivers(1)
            .number_classes(1)
            .class(0)
            .on_receiver_state_transition_callback(|_, _, _| {})
            .build()
            .unwrap();
        let class = server.class_handle(0);
        let _id = server.add_receiver(class).unwrap();

        b.iter(|| {
            let token = server.acquire_slot().expect("slot returns to Free immediately");
            let dropped = server.send_slot(token);
            black_box(dropped.classes.len());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_send_slot, bench_round_trip, bench_class_saturated);
criterion_main!(benches);
