use framejob::{JobSystem, JobSystemConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn small_system(workers: usize) -> JobSystem {
    JobSystem::with_config(JobSystemConfig {
        workers: Some(workers),
        ..JobSystemConfig::default()
    })
}

#[test]
fn continuation_chain_runs_in_order() {
    let scheduler = small_system(4);
    let log = Arc::new(Mutex::new(String::new()));

    let a = Arc::clone(&log);
    scheduler.run_job_with(move |cx| {
        a.lock().unwrap().push('A');
        let b = Arc::clone(&a);
        cx.continuation_with(move |cx| {
            b.lock().unwrap().push('B');
            let c = Arc::clone(&b);
            cx.continuation(move || {
                c.lock().unwrap().push('C');
            });
        });
    });

    // run_job returns only once the whole chain has completed.
    assert_eq!(log.lock().unwrap().as_str(), "ABC");
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn continuation_waits_for_the_jobs_children() {
    const CHILDREN: usize = 64;

    let scheduler = small_system(4);
    let completed = Arc::new(AtomicUsize::new(0));
    let observed_at_continuation = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&completed);
    let observed = Arc::clone(&observed_at_continuation);
    scheduler.run_job_with(move |cx| {
        for _ in 0..CHILDREN {
            let counter = Arc::clone(&counter);
            cx.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let counter = Arc::clone(&counter);
        cx.continuation(move || {
            // Every child has completed before the continuation starts.
            observed.store(counter.load(Ordering::SeqCst), Ordering::SeqCst);
        });
    });

    assert_eq!(observed_at_continuation.load(Ordering::SeqCst), CHILDREN);
    scheduler.shutdown().expect("shutdown failed");
}

#[test]
fn child_continuation_is_inherited_by_the_parent() {
    let scheduler = small_system(4);
    let continuation_ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&continuation_ran);
    scheduler.run_job_with(move |cx| {
        let flag = Arc::clone(&flag);
        cx.schedule_with(move |cx| {
            let flag = Arc::clone(&flag);
            cx.continuation(move || {
                flag.store(true, Ordering::SeqCst);
            });
        });
    });

    // The child's continuation inherits the child's parent (the root), so
    // run_job could not return before it ran.
    assert!(continuation_ran.load(Ordering::SeqCst));
    scheduler.shutdown().expect("shutdown failed");
}
