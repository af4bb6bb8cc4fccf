use framejob::{JobSystem, JobSystemConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn panicking_jobs_do_not_stall_their_parent() {
    let scheduler = JobSystem::with_config(JobSystemConfig {
        workers: Some(4),
        ..JobSystemConfig::default()
    });

    let survivors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&survivors);
    scheduler.run_job_with(move |cx| {
        for i in 0..20 {
            let counter = Arc::clone(&counter);
            cx.schedule(move || {
                if i % 5 == 0 {
                    panic!("job {i} failed");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    // run_job returned: the completion protocol ran for the panicking jobs
    // too, and the healthy ones all finished.
    assert_eq!(survivors.load(Ordering::SeqCst), 16);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn workers_survive_panics_and_keep_serving() {
    let scheduler = JobSystem::with_config(JobSystemConfig {
        workers: Some(2),
        ..JobSystemConfig::default()
    });

    scheduler.run_job(|| panic!("first frame failed"));

    let value = Arc::new(AtomicUsize::new(0));
    let slot = Arc::clone(&value);
    scheduler.run_job_with(move |cx| {
        for _ in 0..8 {
            let slot = Arc::clone(&slot);
            cx.schedule(move || {
                slot.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    assert_eq!(value.load(Ordering::SeqCst), 8);
    scheduler.shutdown().expect("shutdown failed");
}
