mod common;

use common::{FlakyStorage, Harness, coordination};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use turnstile::admission::Registrar;
use turnstile::error::AdmissionError;
use turnstile::lock::event_resource;
use turnstile::model::RegistrationStatus;
use turnstile::notify::{REGISTRATION_CANCELLED, REGISTRATION_CREATED};
use turnstile::storage::EventStorage;

#[test]
fn concurrent_registrations_never_exceed_capacity() {
    let h = Harness::new();
    let ev = h.event("Workshop", 5);
    let people = h.participants(20);
    let created = h.count_notifications(REGISTRATION_CREATED);

    let barrier = Arc::new(Barrier::new(people.len()));
    let handles = people
        .iter()
        .map(|pid| {
            let registrar = Arc::clone(&h.registrar);
            let barrier = Arc::clone(&barrier);
            let pid = *pid;
            thread::spawn(move || {
                barrier.wait();
                registrar.register(ev.event_id, pid)
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let full = results
        .iter()
        .filter(|r| matches!(r, Err(AdmissionError::EventFull(id)) if *id == ev.event_id))
        .count();
    assert_eq!(admitted, 5);
    assert_eq!(full, 15);
    assert_eq!(h.store.confirmed_count(ev.event_id).unwrap(), 5);

    h.drain_notifications();
    assert_eq!(created.load(Ordering::SeqCst), 5);
    assert!(!h.ctx.locks.is_locked(&event_resource(ev.event_id)));
}

#[test]
fn capacity_holds_across_independent_lock_registries() {
    // Two registrars that share a database but not a lock registry, as two
    // processes would. The storage transaction alone has to keep them apart.
    let h = Harness::new();
    let ev = h.event("Concert", 3);
    let people = h.participants(12);
    let storage: Arc<dyn EventStorage> = h.store.clone();
    let other = Arc::new(Registrar::new(
        storage,
        coordination(Duration::from_secs(5)),
    ));

    let barrier = Arc::new(Barrier::new(people.len()));
    let handles = people
        .iter()
        .enumerate()
        .map(|(i, pid)| {
            let registrar = if i % 2 == 0 {
                Arc::clone(&h.registrar)
            } else {
                Arc::clone(&other)
            };
            let barrier = Arc::clone(&barrier);
            let pid = *pid;
            thread::spawn(move || {
                barrier.wait();
                registrar.register(ev.event_id, pid)
            })
        })
        .collect::<Vec<_>>();
    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|r| r.is_ok())
        .count();

    assert_eq!(admitted, 3);
    assert_eq!(h.store.confirmed_count(ev.event_id).unwrap(), 3);
}

#[test]
fn racing_duplicate_registrations_leave_one_row() {
    let h = Harness::new();
    let ev = h.event("Tasting", 50);
    let pid = h.participants(1)[0];

    let barrier = Arc::new(Barrier::new(10));
    let handles = (0..10)
        .map(|_| {
            let registrar = Arc::clone(&h.registrar);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registrar.register(ev.event_id, pid)
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AdmissionError::AlreadyRegistered { .. })))
            .count(),
        9
    );
    assert_eq!(h.store.registration_count(ev.event_id, pid).unwrap(), 1);
}

#[test]
fn full_event_rejects_and_keeps_count() {
    let h = Harness::new();
    let ev = h.event("Masterclass", 2);
    let p = h.participants(3);
    let created = h.count_notifications(REGISTRATION_CREATED);

    h.registrar.register(ev.event_id, p[0]).unwrap();
    h.registrar.register(ev.event_id, p[1]).unwrap();
    let err = h.registrar.register(ev.event_id, p[2]).unwrap_err();

    assert!(matches!(err, AdmissionError::EventFull(id) if id == ev.event_id));
    assert_eq!(h.store.confirmed_count(ev.event_id).unwrap(), 2);
    assert!(h.store.get_registration(ev.event_id, p[2]).unwrap().is_none());
    assert!(!h.ctx.locks.is_locked(&event_resource(ev.event_id)));

    h.drain_notifications();
    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[test]
fn last_seat_goes_to_exactly_one_of_two_racers() {
    let h = Harness::new();
    let ev = h.event("Dinner", 1);
    let p = h.participants(2);

    let barrier = Arc::new(Barrier::new(2));
    let handles = [p[0], p[1]]
        .into_iter()
        .map(|pid| {
            let registrar = Arc::clone(&h.registrar);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registrar.register(ev.event_id, pid)
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(AdmissionError::EventFull(_))))
    );
    assert_eq!(h.store.confirmed_count(ev.event_id).unwrap(), 1);
}

#[test]
fn pending_registrations_do_not_consume_seats() {
    let h = Harness::new();
    let ev = h.event("Seminar", 1);
    let p = h.participants(2);

    let pending = h
        .registrar
        .register_with_status(ev.event_id, p[0], RegistrationStatus::Pending)
        .unwrap();
    assert_eq!(pending.status, RegistrationStatus::Pending);
    h.registrar.register(ev.event_id, p[1]).unwrap();
    assert_eq!(h.store.confirmed_count(ev.event_id).unwrap(), 1);
}

#[test]
fn unknown_event_and_participant_are_reported() {
    let h = Harness::new();
    let ev = h.event("Meetup", 4);
    let pid = h.participants(1)[0];

    let err = h.registrar.register(404, pid).unwrap_err();
    assert!(matches!(err, AdmissionError::NotFound(404)));
    let err = h.registrar.register(ev.event_id, 9_999).unwrap_err();
    assert!(matches!(err, AdmissionError::ParticipantNotFound(9_999)));
}

#[test]
fn transient_failures_are_retried_without_duplicates() {
    let (h, flaky) = Harness::with_flaky(|store| Arc::new(FlakyStorage::new(store).failing_admits(2)));
    let ev = h.event("Retry fair", 5);
    let pid = h.participants(1)[0];

    let reg = h.registrar.register(ev.event_id, pid).unwrap();
    assert_eq!(reg.participant_id, pid);
    assert_eq!(flaky.admit_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.store.registration_count(ev.event_id, pid).unwrap(), 1);
}

#[test]
fn exhausted_retries_surface_the_last_error_and_release_the_lock() {
    let (h, flaky) = Harness::with_flaky(|store| Arc::new(FlakyStorage::new(store).failing_admits(10)));
    let ev = h.event("Unlucky", 5);
    let pid = h.participants(1)[0];
    let created = h.count_notifications(REGISTRATION_CREATED);

    let err = h.registrar.register(ev.event_id, pid).unwrap_err();
    match err {
        AdmissionError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(last, turnstile::error::StorageError::Busy));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(flaky.admit_calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.store.registration_count(ev.event_id, pid).unwrap(), 0);
    assert!(!h.ctx.locks.is_locked(&event_resource(ev.event_id)));

    h.drain_notifications();
    assert_eq!(created.load(Ordering::SeqCst), 0);
}

#[test]
fn fatal_storage_errors_are_not_retried() {
    let (h, flaky) = Harness::with_flaky(|store| Arc::new(FlakyStorage::new(store).broken_admits()));
    let ev = h.event("Broken", 5);
    let pid = h.participants(1)[0];

    let err = h.registrar.register(ev.event_id, pid).unwrap_err();
    assert!(matches!(err, AdmissionError::Storage(_)));
    assert_eq!(flaky.admit_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn lock_timeout_when_another_holder_keeps_the_event() {
    let h = Harness::with_lock_timeout(Duration::from_millis(100));
    let ev = h.event("Contended", 5);
    let pid = h.participants(1)[0];
    let resource = event_resource(ev.event_id);

    let locks = Arc::clone(&h.ctx.locks);
    let held = Arc::new(Barrier::new(2));
    let done = Arc::new(Barrier::new(2));
    let holder = {
        let resource = resource.clone();
        let held = Arc::clone(&held);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let lock = locks.get_lock(&resource);
            let _guard = lock.acquire(Duration::from_secs(1)).unwrap();
            held.wait();
            done.wait();
        })
    };
    held.wait();

    let started = Instant::now();
    let err = h.registrar.register(ev.event_id, pid).unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(90));
    match err {
        AdmissionError::LockTimeout(timeout) => assert_eq!(timeout.resource, resource),
        other => panic!("expected LockTimeout, got {other:?}"),
    }
    assert_eq!(h.store.registration_count(ev.event_id, pid).unwrap(), 0);

    done.wait();
    holder.join().unwrap();
    assert!(!h.ctx.locks.is_locked(&resource));
    h.registrar.register(ev.event_id, pid).unwrap();
}

#[test]
fn unregister_frees_a_seat_and_notifies() {
    let h = Harness::new();
    let ev = h.event("Hike", 1);
    let p = h.participants(2);
    let cancelled = h.capture_notifications(REGISTRATION_CANCELLED);

    h.registrar.register(ev.event_id, p[0]).unwrap();
    assert!(matches!(
        h.registrar.register(ev.event_id, p[1]),
        Err(AdmissionError::EventFull(_))
    ));

    assert!(h.registrar.unregister(ev.event_id, p[0]).unwrap());
    assert!(!h.registrar.unregister(ev.event_id, p[0]).unwrap());
    h.registrar.register(ev.event_id, p[1]).unwrap();

    h.drain_notifications();
    let seen = cancelled.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["participant_id"], p[0]);
}

#[test]
fn registration_notification_carries_the_new_row() {
    let h = Harness::new();
    let ev = h.event("Lecture", 3);
    let pid = h.participants(1)[0];
    let created = h.capture_notifications(REGISTRATION_CREATED);

    let reg = h.registrar.register(ev.event_id, pid).unwrap();
    h.drain_notifications();

    let seen = created.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["event_id"], ev.event_id);
    assert_eq!(seen[0]["participant_id"], pid);
    assert_eq!(seen[0]["registration_id"], reg.registration_id);
    assert_eq!(seen[0]["status"], "confirmed");
}
