use framejob::{JobSystem, JobSystemConfig};
use std::sync::Arc;
use std::time::Duration;

fn small_system(workers: usize) -> JobSystem {
    JobSystem::with_config(JobSystemConfig {
        workers: Some(workers),
        ..JobSystemConfig::default()
    })
}

#[test]
fn shutdown_with_jobs_in_flight_is_graceful() {
    let scheduler = small_system(2);

    for _ in 0..10 {
        scheduler.schedule_detached(|| {
            std::thread::sleep(Duration::from_millis(10));
        });
    }

    // Workers finish whatever they are running and exit; queued jobs may be
    // lost, but shutdown must not hang or report failures.
    scheduler
        .shutdown()
        .expect("shutdown should succeed with jobs in flight");
}

#[test]
fn abandoned_closures_are_dropped_at_shutdown() {
    let scheduler = small_system(2);
    scheduler.stop();

    let payload = Arc::new(());
    let witness = Arc::clone(&payload);
    // With the stop flag already raised this job may never execute.
    scheduler.schedule_detached(move || drop(payload));

    scheduler.shutdown().expect("shutdown failed");

    // Whether the job ran or was drained, its capture was released.
    assert_eq!(Arc::strong_count(&witness), 1);
}

#[test]
fn dropping_the_system_tears_it_down() {
    let scheduler = small_system(2);
    scheduler.schedule_detached(|| {});
    drop(scheduler);
}

#[test]
fn repeated_systems_on_one_thread_are_independent() {
    for _ in 0..5 {
        let scheduler = small_system(2);
        scheduler.run_job_with(|cx| {
            for _ in 0..32 {
                cx.schedule(|| {});
            }
        });
        scheduler.shutdown().expect("shutdown failed");
    }
}
