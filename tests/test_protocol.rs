// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end scenarios for the Server/Client handshake, slot transport, and
// receiver-class admission, driven entirely over in-process side channels.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memcon::error::{ErrorCode, ReceiverState};
use memcon::fsm::ClientState;
use memcon::side_channel::{InProcessSideChannel, SideChannel};
use memcon::wire::Frame;
use memcon::{Client, ClientBuilder, MemoryTechnology, Server, ServerBuilder};

/// Forwards every call to `inner`, counting `Notification` frames sent
/// through it. Lets a test observe the server's notification traffic
/// without the client façade needing to expose a frame-level hook.
struct CountingSideChannel {
    inner: InProcessSideChannel,
    notifications_sent: Arc<AtomicUsize>,
}

impl SideChannel for CountingSideChannel {
    fn send(&self, frame: Frame) -> io::Result<()> {
        if matches!(frame, Frame::Notification) {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.send(frame)
    }

    fn try_recv(&self) -> io::Result<Option<Frame>> {
        self.inner.try_recv()
    }
}

fn connected_pair(num_slots: usize, limit: u32) -> (Server, Client, Arc<Mutex<Vec<(ReceiverState, Option<ErrorCode>)>>>) {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();

    let server = ServerBuilder::new()
        .number_slots(num_slots)
        .slot_content_size(64)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_number_receivers(4)
        .number_classes(1)
        .class(limit)
        .on_receiver_state_transition_callback(move |_id, state, error| recorded.lock().unwrap().push((state, error)))
        .build()
        .expect("server build");

    let class = server.class_handle(0);
    let id = server.add_receiver(class).expect("add_receiver");
    let (server_channel, client_channel) = InProcessSideChannel::pair();
    server.connect_receiver(id, Box::new(server_channel)).expect("connect_receiver");

    let client = ClientBuilder::new()
        .slot_content_size(64)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_outstanding_slots(num_slots)
        .side_channel(Box::new(client_channel))
        .on_state_transition_callback(|_, _| {})
        .build();

    client.poll_reactor();
    server.poll_reactor();

    (server, client, transitions)
}

// Scenario 1: happy path, one class one receiver.
#[test]
fn happy_path_one_class_one_receiver() {
    let (server, client, transitions) = connected_pair(4, 4);
    assert!(transitions.lock().unwrap().iter().any(|(s, _)| *s == ReceiverState::Connected));
    assert_eq!(client.state().0, ClientState::Connected);

    let mut delivered = Vec::new();
    for _ in 0..4 {
        let token = server.acquire_slot().expect("slots available");
        let dropped = server.send_slot(token);
        assert!(dropped.classes.is_empty());
        delivered.push(client.try_receive_slot().expect("delivered through the shared queue"));
    }

    assert!(server.acquire_slot().is_none(), "all four slots are in flight");

    for index in delivered {
        assert!(client.release_slot(index));
    }
    server.reclaim_slots().unwrap();

    assert!(server.acquire_slot().is_some(), "slots must be reclaimed back to Free");
}

// Scenario 2: class saturation.
#[test]
fn class_saturation_drops_immediately() {
    let (server, _client, _transitions) = connected_pair(1, 0);

    let token = server.acquire_slot().unwrap();
    let dropped = server.send_slot(token);
    assert_eq!(dropped.classes.len(), 1);
    assert!(server.acquire_slot().is_some(), "the slot must return to Free immediately, not leak");
}

/// A side channel that errors on the first `try_recv` with a non-broken-pipe
/// error, simulating a peer that crashed outright rather than closing
/// cleanly. `send` always succeeds and is discarded.
struct CrashingSideChannel;

impl SideChannel for CrashingSideChannel {
    fn send(&self, _frame: Frame) -> io::Result<()> {
        Ok(())
    }

    fn try_recv(&self) -> io::Result<Option<Frame>> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer crashed"))
    }
}

// Scenario 3: peer crash mid-handshake.
#[test]
fn peer_crash_mid_handshake_isolates_one_receiver() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorded = transitions.clone();

    let server = ServerBuilder::new()
        .number_slots(2)
        .slot_content_size(64)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_number_receivers(4)
        .number_classes(1)
        .class(4)
        .on_receiver_state_transition_callback(move |id, state, error| recorded.lock().unwrap().push((id, state, error)))
        .build()
        .unwrap();

    let class = server.class_handle(0);
    let crashed_id = server.add_receiver(class).unwrap();
    server.connect_receiver(crashed_id, Box::new(CrashingSideChannel)).unwrap();

    server.poll_reactor();
    assert_eq!(server.get_receiver_state(crashed_id).0, ReceiverState::Corrupted);
    assert!(matches!(server.get_receiver_state(crashed_id).1, Some(ErrorCode::PeerCrashed)));

    let fired = transitions.lock().unwrap();
    let corrupted_events: Vec<_> = fired.iter().filter(|(id, state, _)| *id == crashed_id && *state == ReceiverState::Corrupted).collect();
    assert_eq!(corrupted_events.len(), 1, "the transition must fire exactly once");
    drop(fired);

    // A second, healthy receiver is unaffected.
    let healthy_id = server.add_receiver(class).unwrap();
    let (server_channel, client_channel) = InProcessSideChannel::pair();
    server.connect_receiver(healthy_id, Box::new(server_channel)).unwrap();
    let client = ClientBuilder::new()
        .slot_content_size(64)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_outstanding_slots(2)
        .side_channel(Box::new(client_channel))
        .on_state_transition_callback(|_, _| {})
        .build();
    client.poll_reactor();
    server.poll_reactor();
    assert_eq!(server.get_receiver_state(healthy_id).0, ReceiverState::Connected);

    let token = server.acquire_slot().unwrap();
    let dropped = server.send_slot(token);
    assert!(dropped.classes.is_empty(), "the corrupted receiver is simply skipped, not counted as a drop");
    assert!(client.try_receive_slot().is_some());
}

// Scenario 4: notification coalescing.
#[test]
fn notification_coalescing_delivers_every_slot_exactly_once() {
    let notifications_sent = Arc::new(AtomicUsize::new(0));

    let server = ServerBuilder::new()
        .number_slots(5)
        .slot_content_size(64)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_number_receivers(1)
        .number_classes(1)
        .class(5)
        .on_receiver_state_transition_callback(|_, _, _| {})
        .build()
        .unwrap();
    let class = server.class_handle(0);
    let id = server.add_receiver(class).unwrap();
    let (server_channel, client_channel) = InProcessSideChannel::pair();
    server
        .connect_receiver(id, Box::new(CountingSideChannel { inner: server_channel, notifications_sent: notifications_sent.clone() }))
        .unwrap();

    let client = ClientBuilder::new()
        .slot_content_size(64)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_outstanding_slots(5)
        .side_channel(Box::new(client_channel))
        .on_state_transition_callback(|_, _| {})
        .build();
    client.poll_reactor();
    server.poll_reactor();

    client.request_start_listening().unwrap();
    server.poll_reactor();

    for _ in 0..5 {
        let token = server.acquire_slot().unwrap();
        server.send_slot(token);
    }
    assert!(notifications_sent.load(Ordering::Relaxed) >= 1, "at least one notification must be observed while listening");

    let mut received = Vec::new();
    while let Some(index) = client.try_receive_slot() {
        received.push(index);
    }
    assert_eq!(received.len(), 5, "every sent slot must still be received exactly once");
    let mut dedup = received.clone();
    dedup.sort_by_key(|i| i.0);
    dedup.dedup();
    assert_eq!(dedup.len(), 5);

    for index in received {
        assert!(client.release_slot(index));
    }
    server.reclaim_slots().unwrap();

    client.request_stop_listening().unwrap();
    server.poll_reactor();
    notifications_sent.store(0, Ordering::Relaxed);

    for _ in 0..3 {
        let token = server.acquire_slot().unwrap();
        server.send_slot(token);
    }
    assert_eq!(notifications_sent.load(Ordering::Relaxed), 0, "no notifications after StopListening");
    let mut drained = 0;
    while client.try_receive_slot().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 3, "slots still arrive through the queue, just without a wake-up");
}

// Scenario 5: shutdown with an outstanding token is a precondition
// violation, not a recoverable error.
#[test]
#[should_panic(expected = "outstanding SlotTokens")]
fn shutdown_with_outstanding_token_aborts() {
    let (server, _client, _transitions) = connected_pair(4, 4);
    let _token = server.acquire_slot().unwrap();
    server.shutdown();
}

// Scenario 6: double StartListening corrupts the receiver locally, without
// ever reaching the wire (and the server never sees a second StartListening).
#[test]
fn double_start_listening_corrupts_without_reaching_the_wire() {
    let (server, client, _transitions) = connected_pair(4, 4);
    client.request_start_listening().unwrap();
    client.request_start_listening().unwrap();
    assert_eq!(client.state().0, ClientState::Corrupted);

    server.poll_reactor();
    assert_eq!(server.get_receiver_state(server.add_receiver(server.class_handle(0)).unwrap()).0, ReceiverState::Connecting);
}

// Round-trip law: AcquireSlot then UnacquireSlot is a no-op — repeating it
// far more times than there are slots must never exhaust the pool.
#[test]
fn acquire_then_unacquire_never_leaks_a_slot() {
    let (server, _client, _transitions) = connected_pair(2, 4);
    for _ in 0..10 {
        let token = server.acquire_slot().expect("unacquire must fully return the slot to Free each time");
        server.unacquire_slot(token);
    }
    assert!(server.acquire_slot().is_some());
}

// Round-trip law: ReclaimSlots called repeatedly without intervening sends
// or releases is a no-op.
#[test]
fn reclaim_without_new_releases_is_idempotent() {
    let (server, _client, _transitions) = connected_pair(4, 4);
    server.reclaim_slots().unwrap();
    server.reclaim_slots().unwrap();
    assert!(server.acquire_slot().is_some());
}

// Boundary behaviour: connecting a receiver past max_number_receivers fails
// cleanly (returns None, does not panic or corrupt the table).
#[test]
fn exceeding_max_number_receivers_fails_cleanly() {
    let server = ServerBuilder::new()
        .number_slots(2)
        .slot_content_size(32)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_number_receivers(1)
        .number_classes(1)
        .class(2)
        .on_receiver_state_transition_callback(|_, _, _| {})
        .build()
        .unwrap();
    let class = server.class_handle(0);
    assert!(server.add_receiver(class).is_some());
    assert!(server.add_receiver(class).is_none());
}

// Universal invariant 4: a ReceiverId distinguishes two receivers that
// occupied the same ReceiverIndex at different times, because the
// underlying id is minted fresh (monotonic) each time, even though the
// index is recycled once a receiver is fully torn down and removed.
#[test]
fn receiver_id_distinguishes_recycled_indices() {
    let server = ServerBuilder::new()
        .number_slots(2)
        .slot_content_size(32)
        .slot_content_alignment(8)
        .memory_technology(MemoryTechnology::InProcess)
        .max_number_receivers(1)
        .number_classes(1)
        .class(2)
        .on_receiver_state_transition_callback(|_, _, _| {})
        .build()
        .unwrap();
    let class = server.class_handle(0);

    let first = server.add_receiver(class).unwrap();
    server.shutdown();
    server.remove_receiver(first);

    let second = server.add_receiver(class).unwrap();
    assert_ne!(first, second, "a fresh receiver reusing the same slot must get a distinct ReceiverId");
}

// Clean shutdown initiated by the server reaches the client as
// DisconnectedRemote first (outstanding slots may still need draining),
// then Disconnected once the application acknowledges it has drained them.
#[test]
fn clean_shutdown_drains_before_disconnecting() {
    let (server, client, _transitions) = connected_pair(4, 4);
    server.shutdown();
    client.poll_reactor();
    assert_eq!(client.state().0, ClientState::DisconnectedRemote);
    client.mark_drained();
    assert_eq!(client.state().0, ClientState::Disconnected);
}
