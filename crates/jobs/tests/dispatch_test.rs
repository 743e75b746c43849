//! Job dispatch protocol end to end on the in-memory broker.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::timeout;

use courier::{
    BrokerConfig, ClientSettings, InMemoryBroker, MessagingClient, NamespaceConfig,
    PublishOptions, ServiceIdentity, TopologyResolver, VirtualHostAdmin,
};
use courier_jobs::{
    JobDispatcher, JobError, JobEvent, JobEventKind, JobId, JobState, JobWorker,
};

use common::{dispatcher, tenant, worker, ScriptedRunner, UntilStopped, SHORT, TIMEOUT};

async fn wait_for(dispatcher: &JobDispatcher, job_id: JobId, state: JobState) {
    timeout(TIMEOUT, async {
        while dispatcher.state(job_id) != Some(state) {
            dispatcher.poll_events(SHORT).await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {job_id} never reached {state}"));
}

#[tokio::test]
async fn new_job_is_claimed_by_exactly_one_worker() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let mut workers = Vec::new();
    for i in 0..3 {
        workers.push(worker(&broker, &format!("w{i}"), Arc::new(ScriptedRunner::default())).await);
    }

    d.submit(7).await.unwrap();
    assert_eq!(d.state(7), Some(JobState::Submitted));

    let mut claims = Vec::new();
    for w in &workers {
        let w = Arc::clone(w);
        claims.push(tokio::spawn(async move { (w.name(), w.claim_next(SHORT).await.unwrap()) }));
    }
    let mut winners = Vec::new();
    for claim in claims {
        let (name, claimed) = timeout(TIMEOUT, claim).await.expect("timed out").unwrap();
        if let Some(job_id) = claimed {
            assert_eq!(job_id, 7);
            winners.push(name);
        }
    }
    assert_eq!(winners.len(), 1);

    wait_for(&d, 7, JobState::Claimed).await;
    assert_eq!(d.worker_of(7), Some(winners[0].clone()));
}

#[tokio::test]
async fn stop_reaches_every_worker() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let mut workers = Vec::new();
    for i in 0..3 {
        workers.push(worker(&broker, &format!("w{i}"), Arc::new(UntilStopped)).await);
    }

    d.submit(7).await.unwrap();
    d.cancel(7).await.unwrap();
    assert!(d.is_cancel_requested(7));

    for w in &workers {
        assert_eq!(w.check_stops(SHORT).await.unwrap(), vec![7]);
        assert!(w.check_stops(SHORT).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn successful_job_ends_done() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let w = worker(&broker, "w0", Arc::new(ScriptedRunner::default())).await;

    d.submit(1).await.unwrap();
    assert_eq!(w.claim_next(SHORT).await.unwrap(), Some(1));
    assert_eq!(w.run_job(1).await.unwrap(), JobEventKind::Succeeded);

    assert_eq!(d.poll_events(SHORT).await.unwrap(), 3);
    assert_eq!(d.state(1), Some(JobState::Done));
    assert!(w.running_jobs().is_empty());
}

#[tokio::test]
async fn failing_job_ends_failed_with_reason() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let runner = Arc::new(ScriptedRunner {
        fail: vec![2],
        ..ScriptedRunner::default()
    });
    let w = worker(&broker, "w0", runner.clone()).await;

    d.submit(2).await.unwrap();
    w.claim_next(SHORT).await.unwrap();
    assert_eq!(w.run_job(2).await.unwrap(), JobEventKind::Failed);

    wait_for(&d, 2, JobState::Failed).await;
    assert_eq!(d.message_of(2).as_deref(), Some("job 2 blew up"));
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelling_a_running_job_aborts_it() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let w = worker(&broker, "w0", Arc::new(UntilStopped)).await;
    let idle = worker(&broker, "w1", Arc::new(UntilStopped)).await;

    d.submit(7).await.unwrap();
    assert_eq!(w.claim_next(SHORT).await.unwrap(), Some(7));
    let job = {
        let w = Arc::clone(&w);
        tokio::spawn(async move { w.run_job(7).await })
    };
    wait_for(&d, 7, JobState::Running).await;
    assert_eq!(w.running_jobs(), vec![7]);

    d.cancel(7).await.unwrap();
    // Only the instance running the job acts on the stop.
    assert_eq!(idle.check_stops(SHORT).await.unwrap(), vec![7]);
    assert!(idle.running_jobs().is_empty());
    assert_eq!(w.check_stops(SHORT).await.unwrap(), vec![7]);

    let outcome = timeout(TIMEOUT, job).await.expect("job ignored stop").unwrap();
    assert_eq!(outcome.unwrap(), JobEventKind::Aborted);
    wait_for(&d, 7, JobState::Cancelled).await;
}

#[tokio::test]
async fn job_cancelled_before_claim_is_never_run() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let runner = Arc::new(ScriptedRunner::default());
    let w = worker(&broker, "w0", runner.clone()).await;

    d.submit(5).await.unwrap();
    d.cancel(5).await.unwrap();
    assert_eq!(w.check_stops(SHORT).await.unwrap(), vec![5]);

    assert_eq!(w.claim_next(SHORT).await.unwrap(), None);
    wait_for(&d, 5, JobState::Cancelled).await;
    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    assert_eq!(w.claim_next(SHORT).await.unwrap(), None);
}

#[tokio::test]
async fn stop_between_claim_and_run_aborts_the_job() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let runner = Arc::new(ScriptedRunner::default());
    let w = worker(&broker, "w0", runner.clone()).await;

    d.submit(9).await.unwrap();
    assert_eq!(w.claim_next(SHORT).await.unwrap(), Some(9));
    assert_eq!(w.running_jobs(), vec![9]);

    d.cancel(9).await.unwrap();
    assert_eq!(w.check_stops(SHORT).await.unwrap(), vec![9]);

    let outcome = timeout(TIMEOUT, w.run_job(9)).await.expect("stop was lost");
    assert_eq!(outcome.unwrap(), JobEventKind::Aborted);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    assert!(w.running_jobs().is_empty());
    wait_for(&d, 9, JobState::Cancelled).await;
}

#[tokio::test]
async fn stop_between_claim_and_run_reaches_long_job() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let w = worker(&broker, "w0", Arc::new(UntilStopped)).await;

    d.submit(10).await.unwrap();
    assert_eq!(w.claim_next(SHORT).await.unwrap(), Some(10));
    d.cancel(10).await.unwrap();
    w.check_stops(SHORT).await.unwrap();

    let outcome = timeout(TIMEOUT, w.run_job(10)).await.expect("stop was lost");
    assert_eq!(outcome.unwrap(), JobEventKind::Aborted);
}

#[tokio::test]
async fn submit_failure_leaves_job_submitted() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let broker_config = BrokerConfig {
        management_url_override: Some(format!("http://{addr}")),
        connection_timeout_secs: 2,
        ..BrokerConfig::default()
    };
    let admin = VirtualHostAdmin::new(&broker_config, &NamespaceConfig::default()).unwrap();
    let client = Arc::new(MessagingClient::new(
        TopologyResolver::new("courier", ServiceIdentity::new("rs-dispatch", "d0")),
        Arc::new(admin),
        Arc::new(InMemoryBroker::default()),
        ClientSettings::default(),
    ));
    let d = JobDispatcher::new(client, tenant());

    let err = d.submit(9).await.unwrap_err();
    assert!(matches!(err, JobError::Publish(_)), "{err}");
    assert_eq!(d.state(9), Some(JobState::Submitted));
    // Still submittable.
    assert!(matches!(d.submit(9).await, Err(JobError::Publish(_))));
}

#[tokio::test]
async fn claimed_job_cannot_be_resubmitted() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let w = worker(&broker, "w0", Arc::new(ScriptedRunner::default())).await;

    d.submit(3).await.unwrap();
    w.claim_next(SHORT).await.unwrap();
    wait_for(&d, 3, JobState::Claimed).await;

    let err = d.submit(3).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::AlreadySubmitted {
            job_id: 3,
            state: JobState::Claimed
        }
    ));
}

#[tokio::test]
async fn reports_for_unknown_jobs_are_ignored() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let other = common::client(&broker, "rs-other", "x");
    other
        .publish_event(
            &tenant(),
            &JobEvent::new(99, JobEventKind::Running, "rs-other/x"),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(d.poll_events(SHORT).await.unwrap(), 0);
    assert_eq!(d.state(99), None);
    assert!(matches!(
        d.record(&JobEvent::new(99, JobEventKind::Running, "rs-other/x")),
        Err(JobError::UnknownJob(99))
    ));
}

#[tokio::test]
async fn worker_loop_runs_jobs_until_shutdown() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let w: Arc<JobWorker> = worker(&broker, "w0", Arc::new(ScriptedRunner::default())).await;
    let shutdown = Arc::new(Notify::new());
    let handle = tokio::spawn(Arc::clone(&w).run(Arc::clone(&shutdown)));

    for job_id in [1, 2] {
        d.submit(job_id).await.unwrap();
    }
    wait_for(&d, 1, JobState::Done).await;
    wait_for(&d, 2, JobState::Done).await;

    shutdown.notify_one();
    timeout(TIMEOUT, handle).await.expect("worker did not stop").unwrap();
}

#[tokio::test]
async fn shutdown_aborts_running_jobs() {
    let broker = InMemoryBroker::default();
    let d = dispatcher(&broker).await;
    let w = worker(&broker, "w0", Arc::new(UntilStopped)).await;
    let shutdown = Arc::new(Notify::new());
    let handle = tokio::spawn(Arc::clone(&w).run(Arc::clone(&shutdown)));

    d.submit(4).await.unwrap();
    wait_for(&d, 4, JobState::Running).await;

    shutdown.notify_one();
    timeout(TIMEOUT, handle).await.expect("worker did not stop").unwrap();
    wait_for(&d, 4, JobState::Cancelled).await;
}
