//! Mailbox protocol tests: several threads of one process sharing an arena.
//!
//! ```bash
//! cargo test -p strata-mbox --test mailbox -- --nocapture
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strata_mbox::{
    Arena, ComponentId, Endpoint, MailboxSet, MboxConfig, MboxError, Mid, MsgHeader, MsgType, SendMode,
    mailbox_size,
};

static NEXT: AtomicU32 = AtomicU32::new(0);

/// A config whose arena and semaphore files are private to this test.
fn test_config() -> MboxConfig {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let key = ((pid & 0x7FFF) << 16) | (n << 1);
    let cfg = MboxConfig {
        shm_dir: std::env::temp_dir(),
        arena_name: format!("strata_mbox_test_{pid}_{n}"),
        arena_size: 64 << 10,
        lock_sem_key: key,
        wait_sem_key: key | 1,
        log_level: "debug".into(),
    };
    // leftovers of an earlier run that reused this pid
    for path in [cfg.arena_path(), cfg.lock_sem_path(), cfg.wait_sem_path()] {
        let _ = std::fs::remove_file(path);
    }
    cfg
}

fn create_arena() -> Arena {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("strata_mbox=debug")
        .with_test_writer()
        .try_init();
    Arena::create_all(&test_config()).expect("create arena")
}

/// Polls `cond` for up to two seconds.
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

const SENDER: ComponentId = ComponentId(30);
const OWNER: ComponentId = ComponentId(7);
const BOX: ComponentId = ComponentId(7);

#[test]
fn single_slot_mailbox_holds_one_message() {
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 1, 64).unwrap();

    let msg = [0xAB; 40];
    let mid = Mid::local(SENDER);
    assert_eq!(arena.send(SENDER, BOX, SendMode::NonBlocking, &mid, &[&msg]).unwrap(), 40);
    assert!(matches!(
        arena.send(SENDER, BOX, SendMode::NonBlocking, &mid, &[&msg]),
        Err(MboxError::NoSpace { .. })
    ));

    thread::scope(|s| {
        let blocked = s.spawn(|| arena.send(SENDER, BOX, SendMode::Blocking, &mid, &[&[0xCD; 40]]));

        assert!(eventually(|| arena.is_watching(BOX, SENDER).unwrap()));

        let mut out = [0u8; 64];
        let (from, n) = arena.receive(BOX, &mut out).unwrap().unwrap();
        assert_eq!(from, mid);
        assert_eq!(&out[..n], &msg);

        assert_eq!(blocked.join().unwrap().unwrap(), 40);
    });

    assert!(!arena.is_watching(BOX, SENDER).unwrap());
    let mut out = [0u8; 64];
    let (_, n) = arena.receive(BOX, &mut out).unwrap().unwrap();
    assert_eq!(&out[..n], &[0xCD; 40]);
    assert!(arena.receive(BOX, &mut out).unwrap().is_none());

    let stats = arena.mailbox_stats(BOX).unwrap();
    assert_eq!(stats.ring.count, 2);
    // the non-blocking attempt and the blocked sender's first try
    assert_eq!(stats.ring.reject_count, 2);
    assert_eq!(stats.received_count, 2);

    arena.delete_all().unwrap();
}

#[test]
fn wait_one_times_out_then_returns_on_send() {
    let arena = create_arena();
    let waiter = ComponentId(9);
    let events = ComponentId(20);
    arena.create_mailbox(waiter, waiter, 4, 32).unwrap();
    arena.create_mailbox(waiter, events, 4, 32).unwrap();
    let mut set = MailboxSet::new(waiter);
    set.add(events);
    set.add(waiter);

    let start = Instant::now();
    assert!(matches!(
        arena.wait_one(waiter, &set, Some(Duration::from_millis(100))),
        Err(MboxError::TimedOut)
    ));
    assert!(start.elapsed() >= Duration::from_millis(90));

    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            arena
                .send(SENDER, events, SendMode::NonBlocking, &Mid::local(SENDER), &[b"event"])
                .unwrap();
        });

        let start = Instant::now();
        arena.wait_one(waiter, &set, Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    });

    let mut out = [0u8; 32];
    let (_, n) = arena.receive(events, &mut out).unwrap().unwrap();
    assert_eq!(&out[..n], b"event");

    arena.delete_all().unwrap();
}

#[test]
fn blocked_sender_sees_deletion() {
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 1, 16).unwrap();
    let mid = Mid::local(SENDER);
    arena.send(SENDER, BOX, SendMode::NonBlocking, &mid, &[&[1; 16]]).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| arena.send(SENDER, BOX, SendMode::Blocking, &mid, &[&[2; 16]]));
        assert!(eventually(|| arena.is_watching(BOX, SENDER).unwrap()));
        arena.delete_mailbox(BOX).unwrap();
        assert!(matches!(blocked.join().unwrap(), Err(MboxError::NotFound(id)) if id == BOX));
    });

    arena.delete_all().unwrap();
}

#[test]
fn backpressure_keeps_every_message_in_order() {
    const COUNT: u32 = 500;
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 2, 8).unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            let mid = Mid::local(SENDER);
            for i in 0..COUNT {
                arena
                    .send(SENDER, BOX, SendMode::Blocking, &mid, &[&i.to_le_bytes()])
                    .unwrap();
            }
        });

        let mut out = [0u8; 8];
        let mut expected = 0u32;
        while expected < COUNT {
            // every send posts the owner, so this must never time out
            arena.wait_one(OWNER, &single_set(), Some(Duration::from_secs(5))).unwrap();
            while let Some((_, n)) = arena.receive(BOX, &mut out).unwrap() {
                assert_eq!(n, 4);
                assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), expected);
                expected += 1;
            }
        }
    });

    assert!(!arena.is_watching(BOX, SENDER).unwrap());
    let stats = arena.mailbox_stats(BOX).unwrap();
    assert_eq!(stats.ring.count, COUNT as u64);
    assert_eq!(stats.ring.pending, 0);

    arena.delete_all().unwrap();
}

#[test]
fn wait_after_drain_sees_the_next_message() {
    let arena = create_arena();
    let waiter = ComponentId(9);
    arena.create_mailbox(waiter, waiter, 4, 16).unwrap();
    let mut set = MailboxSet::new(waiter);
    set.add(waiter);
    let mid = Mid::local(SENDER);
    let mut out = [0u8; 16];

    arena.send(SENDER, waiter, SendMode::NonBlocking, &mid, &[b"one"]).unwrap();
    arena.wait_one(waiter, &set, Some(Duration::from_secs(2))).unwrap();
    // the empty read at the end of the drain still counts as a read
    while arena.receive(waiter, &mut out).unwrap().is_some() {}

    arena.send(SENDER, waiter, SendMode::NonBlocking, &mid, &[b"two"]).unwrap();
    let start = Instant::now();
    arena.wait_one(waiter, &set, Some(Duration::from_secs(2))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(arena.receive(waiter, &mut out).unwrap(), Some((mid, 3)));
    assert_eq!(&out[..3], b"two");

    arena.delete_all().unwrap();
}

#[test]
fn blocked_sender_gives_back_unrelated_wakeups() {
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 1, 16).unwrap();
    arena.create_mailbox(SENDER, SENDER, 2, 16).unwrap();
    let mut own = MailboxSet::new(SENDER);
    own.add(SENDER);
    let mid = Mid::local(SENDER);
    arena.send(SENDER, BOX, SendMode::NonBlocking, &mid, &[&[1; 16]]).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| arena.send(SENDER, BOX, SendMode::Blocking, &mid, &[&[2; 16]]));
        assert!(eventually(|| arena.is_watching(BOX, SENDER).unwrap()));

        // mail for the blocked sender posts the semaphore it sleeps on
        let other = ComponentId(40);
        arena
            .send(other, SENDER, SendMode::NonBlocking, &Mid::local(other), &[b"hello"])
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(arena.is_watching(BOX, SENDER).unwrap());

        let mut out = [0u8; 16];
        arena.receive(BOX, &mut out).unwrap().unwrap();
        assert_eq!(blocked.join().unwrap().unwrap(), 16);
    });

    assert!(!arena.is_watching(BOX, SENDER).unwrap());
    // the wakeup for "hello" is still there
    arena.wait_one(SENDER, &own, Some(Duration::ZERO)).unwrap();
    let mut out = [0u8; 16];
    assert_eq!(arena.receive(SENDER, &mut out).unwrap(), Some((Mid::local(ComponentId(40)), 5)));

    arena.delete_all().unwrap();
}

fn single_set() -> MailboxSet {
    let mut set = MailboxSet::new(OWNER);
    set.add(BOX);
    set
}

#[test]
fn delete_is_idempotent_and_ids_are_reusable() {
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 4, 16).unwrap();
    assert!(matches!(
        arena.create_mailbox(OWNER, BOX, 4, 16),
        Err(MboxError::AlreadyExists(id)) if id == BOX
    ));

    arena.delete_mailbox(BOX).unwrap();
    assert!(matches!(arena.delete_mailbox(BOX), Err(MboxError::NotFound(_))));
    assert!(!arena.mailbox_exists(BOX).unwrap());

    arena.create_mailbox(OWNER, BOX, 2, 16).unwrap();
    assert_eq!(arena.mailbox_stats(BOX).unwrap().ring.count, 0);

    arena.delete_all().unwrap();
}

#[test]
fn missing_mailbox_is_not_found() {
    let arena = create_arena();
    let mid = Mid::local(SENDER);
    let mut out = [0u8; 16];
    assert!(matches!(
        arena.send(SENDER, BOX, SendMode::Blocking, &mid, &[b"x"]),
        Err(MboxError::NotFound(_))
    ));
    assert!(matches!(arena.receive(BOX, &mut out), Err(MboxError::NotFound(_))));
    assert!(matches!(arena.mailbox_stats(BOX), Err(MboxError::NotFound(_))));
    arena.delete_all().unwrap();
}

#[test]
fn short_buffer_leaves_the_message_queued() {
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 2, 32).unwrap();
    let mid = Mid::local(SENDER);
    arena.send(SENDER, BOX, SendMode::NonBlocking, &mid, &[&[5; 20]]).unwrap();

    let mut small = [0u8; 8];
    assert!(matches!(
        arena.receive(BOX, &mut small),
        Err(MboxError::TooSmall { needed: 20, provided: 8 })
    ));
    let mut out = [0u8; 32];
    assert_eq!(arena.receive(BOX, &mut out).unwrap(), Some((mid, 20)));

    arena.delete_all().unwrap();
}

#[test]
fn arena_space_is_reclaimed_after_delete() {
    let arena = create_arena();
    let per_box = mailbox_size(8, 256);
    let mut created = Vec::new();
    for raw in 10..64u16 {
        match arena.create_mailbox(OWNER, ComponentId(raw), 8, 256) {
            Ok(()) => created.push(ComponentId(raw)),
            Err(e) => {
                assert!(e.is_capacity(), "unexpected error {e}");
                break;
            }
        }
    }
    assert!(created.len() >= 2, "arena fits only {} mailboxes of {per_box} bytes", created.len());
    let last = ComponentId(created.last().unwrap().0 + 1);
    assert!(arena.create_mailbox(OWNER, last, 8, 256).is_err());

    arena.delete_mailbox(created[0]).unwrap();
    arena.create_mailbox(OWNER, last, 8, 256).unwrap();

    let snapshot = arena.snapshot().unwrap();
    assert_eq!(snapshot.mailboxes.len(), created.len());
    assert!(snapshot.mailboxes.iter().all(|m| m.owner == OWNER));

    arena.delete_all().unwrap();
}

#[test]
fn second_create_fails_and_map_attaches() {
    let cfg = test_config();
    let arena = Arena::create_all(&cfg).unwrap();
    assert!(matches!(Arena::create_all(&cfg), Err(MboxError::ArenaExists(_))));

    let other = Arena::map_all(&cfg).unwrap();
    arena.create_mailbox(OWNER, BOX, 2, 16).unwrap();
    other
        .send(SENDER, BOX, SendMode::NonBlocking, &Mid::local(SENDER), &[b"hi"])
        .unwrap();
    let mut out = [0u8; 16];
    assert_eq!(arena.receive(BOX, &mut out).unwrap(), Some((Mid::local(SENDER), 2)));

    other.unmap_all();
    arena.delete_all().unwrap();
    assert!(!cfg.arena_path().exists());
    assert!(Arena::map_all(&cfg).is_err());
}

#[test]
fn dump_lists_every_mailbox() {
    let arena = create_arena();
    arena.create_mailbox(OWNER, BOX, 2, 16).unwrap();
    arena.create_mailbox(OWNER, ComponentId(12), 2, 16).unwrap();
    arena
        .send(SENDER, BOX, SendMode::NonBlocking, &Mid::local(SENDER), &[b"abc"])
        .unwrap();

    let mut out = Vec::new();
    arena.dump_stats(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("2 mailbox(es)"));
    assert!(text.contains("mailbox #7 (owner #7)"));
    assert!(text.contains("mailbox #12 (owner #7)"));
    assert!(text.contains("1 sent, 1 pending"));

    arena.delete_all().unwrap();
}

#[test]
#[should_panic(expected = "does not own")]
fn waiting_on_a_foreign_mailbox_panics() {
    let arena = create_arena();
    let waiter = ComponentId(9);
    arena.create_mailbox(waiter, waiter, 2, 16).unwrap();
    arena.create_mailbox(OWNER, BOX, 2, 16).unwrap();
    let mut set = MailboxSet::new(waiter);
    set.add(waiter);
    set.add(BOX);

    arena
        .send(SENDER, waiter, SendMode::NonBlocking, &Mid::local(SENDER), &[b"x"])
        .unwrap();
    let _ = arena.wait_one(waiter, &set, Some(Duration::from_secs(1)));
}

#[test]
fn endpoints_exchange_typed_messages() {
    const PING: MsgType = MsgType(1);
    const PONG: MsgType = MsgType(2);
    let arena = create_arena();
    let client_id = ComponentId::TEST_FIRST;
    let server_id = ComponentId(50);

    let mut server = Endpoint::open(&arena, server_id, 4, 64).unwrap();
    let mut client = Endpoint::open(&arena, client_id, 4, 64).unwrap();

    thread::scope(|s| {
        s.spawn(move || {
            server.wait(Some(Duration::from_secs(5))).unwrap();
            let reply = {
                let msg = server.recv_msg().unwrap().unwrap();
                assert_eq!(msg.header.msg_type, PING);
                assert_eq!(msg.from.id, client_id);
                assert_eq!(msg.mailbox, server_id);
                let mut body = msg.body.to_vec();
                body.reverse();
                body
            };
            server.send_msg(client_id, PONG, &reply).unwrap();
            server.close().unwrap();
        });

        client.send_msg(server_id, PING, b"abc").unwrap();
        client.wait(Some(Duration::from_secs(5))).unwrap();
        let msg = client.recv_msg().unwrap().unwrap();
        assert_eq!(msg.header.msg_type, PONG);
        assert_eq!(msg.body, b"cba");
    });

    assert!(!arena.mailbox_exists(server_id).unwrap());
    assert!(matches!(
        client.try_send_msg(server_id, PING, b"late"),
        Err(MboxError::NotFound(_))
    ));
    assert!(client.recv_msg().unwrap().is_none());
    client.close().unwrap();

    arena.delete_all().unwrap();
}

#[test]
fn endpoint_with_event_mailbox_drains_both() {
    let arena = create_arena();
    let id = ComponentId::VRT;
    let mut ep = Endpoint::open(&arena, id, 4, 16).unwrap();
    ep.add_mailbox(ComponentId::VRT_EVENTS, 4, 16).unwrap();
    assert_eq!(ep.mailboxes().len(), 2);

    let mid = Mid::local(SENDER);
    arena
        .send(SENDER, ComponentId::VRT_EVENTS, SendMode::NonBlocking, &mid, &[&[0, 0, 0, 0], b"ev"])
        .unwrap();
    arena
        .send(SENDER, id, SendMode::NonBlocking, &mid, &[&[1, 0, 0, 0], b"req"])
        .unwrap();

    ep.wait(Some(Duration::ZERO)).unwrap();
    let first = ep.recv_msg().unwrap().unwrap();
    assert_eq!((first.mailbox, first.body), (id, &b"req"[..]));
    let second = ep.recv_msg().unwrap().unwrap();
    assert_eq!((second.mailbox, second.body), (ComponentId::VRT_EVENTS, &b"ev"[..]));
    assert!(ep.recv_msg().unwrap().is_none());

    ep.close().unwrap();
    arena.delete_all().unwrap();
}

#[test]
fn endpoint_receives_a_frame_larger_than_its_mailbox_size() {
    let arena = create_arena();
    let id = ComponentId(50);
    let mut ep = Endpoint::open(&arena, id, 4, 16).unwrap();

    let large = [0x5A; 60];
    let header = MsgHeader::new(MsgType(3)).encode();
    let mid = Mid::local(SENDER);
    assert_eq!(arena.send(SENDER, id, SendMode::NonBlocking, &mid, &[&header, &large]).unwrap(), 64);
    arena.send(SENDER, id, SendMode::NonBlocking, &mid, &[&header, b"small"]).unwrap();

    let first = ep.recv_msg().unwrap().unwrap();
    assert_eq!(first.header.msg_type, MsgType(3));
    assert_eq!(first.body, &large[..]);
    let second = ep.recv_msg().unwrap().unwrap();
    assert_eq!(second.body, b"small");
    assert!(ep.recv_msg().unwrap().is_none());

    ep.close().unwrap();
    arena.delete_all().unwrap();
}
