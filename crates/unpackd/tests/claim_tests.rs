//! A queued job is claimed by exactly one caller, however many race for it.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{draft, job_with_archives, TestHarness};

use unpackd::{JobStatus, JobStore, PasswordStrategy};

const CLAIMERS: usize = 8;

/// Runs one claim per store on its own thread, all released at once.
fn race(stores: Vec<JobStore>) -> usize {
    let barrier = Arc::new(Barrier::new(stores.len()));
    let handles: Vec<_> = stores
        .into_iter()
        .map(|store| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.claim_next_queued().unwrap()
            })
        })
        .collect();

    handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .count()
}

#[test]
fn test_shared_handle_claims_once() {
    let h = TestHarness::new();
    let id = h.submit(&job_with_archives("/data", &["a.zip"], draft(PasswordStrategy::None)));

    let winners = race((0..CLAIMERS).map(|_| h.store.clone()).collect());

    assert_eq!(winners, 1);
    assert_eq!(h.store.get_job(id).unwrap().status, JobStatus::Running);
}

#[test]
fn test_separate_connections_claim_once() {
    let h = TestHarness::new();
    let id = h.submit(&job_with_archives("/data", &["a.zip"], draft(PasswordStrategy::None)));

    // Opened up front so migrations never run concurrently.
    let stores: Vec<JobStore> = (0..CLAIMERS).map(|_| h.reopen()).collect();
    let winners = race(stores);

    assert_eq!(winners, 1);
    assert_eq!(h.store.get_job(id).unwrap().status, JobStatus::Running);
}

#[test]
fn test_each_job_claimed_once_across_connections() {
    let h = TestHarness::new();
    let ids: Vec<_> = (0..3)
        .map(|i| {
            h.submit(&job_with_archives(
                &format!("/data/{}", i),
                &["a.zip"],
                draft(PasswordStrategy::None),
            ))
        })
        .collect();

    let stores: Vec<JobStore> = (0..CLAIMERS).map(|_| h.reopen()).collect();
    let winners = race(stores);

    assert_eq!(winners, ids.len());
    for id in ids {
        assert_eq!(h.store.get_job(id).unwrap().status, JobStatus::Running);
    }
    assert!(h.store.claim_next_queued().unwrap().is_none());
}
