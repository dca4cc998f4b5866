mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stowage_app::{DAEMON_COMPONENT, OrchestratorError, RecoveryReport};
use stowage_events::{Event, JobState};
use stowage_test_support::mocks::StoreFaults;
use stowage_transfer_core::{DaemonJobId, DaemonState, DownloadJob};
use tokio::task::JoinSet;
use tokio::time;

use support::{Harness, OWNER, SOURCE, daemon_id};

const MAGNET: &str = "magnet:?xt=urn:btih:08ada5a7a6183aae1e09d831df6748d566095a10";

#[tokio::test]
async fn enqueue_hands_job_to_daemon_and_activates() -> Result<()> {
    let h = Harness::new()?;
    let job = h
        .orchestrator
        .enqueue(OWNER, SOURCE, "/isos/debian.iso")
        .await?;

    assert_eq!(job.state, JobState::Active);
    let gid = daemon_id(&job)?;
    assert_eq!(
        h.daemon.staging_of(&gid),
        Some(h.orchestrator.staging_dir(job.id))
    );
    assert_eq!(h.daemon.source_of(&gid).as_deref(), Some(SOURCE));

    let events = h.published().await;
    assert!(matches!(
        events.as_slice(),
        [
            Event::JobQueued { .. },
            Event::JobStateChanged {
                state: JobState::Active,
                ..
            }
        ]
    ));
    Ok(())
}

#[tokio::test]
async fn destination_is_held_until_the_job_finishes() -> Result<()> {
    let h = Harness::new()?;
    let first = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;

    let second = h
        .orchestrator
        .enqueue(OWNER, "https://other.example/x.iso", "/x.iso")
        .await;
    assert!(matches!(
        second,
        Err(OrchestratorError::Conflict { ref existing }) if existing.id == first.id
    ));

    // Another owner may use the same path.
    h.orchestrator.enqueue("bob", SOURCE, "/x.iso").await?;

    h.daemon.fail(&daemon_id(&first)?, "404 Not Found");
    h.orchestrator.poll().await?;
    let again = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    assert_ne!(again.id, first.id);
    assert_eq!(again.state, JobState::Active);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_admit_exactly_one() -> Result<()> {
    let h = Harness::new()?;
    let mut attempts = JoinSet::new();
    for attempt in 0..16 {
        let orchestrator = Arc::clone(&h.orchestrator);
        attempts.spawn(async move {
            orchestrator
                .enqueue(OWNER, &format!("{SOURCE}?mirror={attempt}"), "/race.iso")
                .await
        });
    }

    let mut accepted = 0;
    let mut conflicts = 0;
    while let Some(joined) = attempts.join_next().await {
        match joined? {
            Ok(_) => accepted += 1,
            Err(OrchestratorError::Conflict { .. }) => conflicts += 1,
            Err(other) => return Err(other.into()),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(conflicts, 15);
    assert_eq!(h.daemon.add_calls(), 1);
    assert_eq!(h.orchestrator.list_for_owner(OWNER).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn rejected_fetch_is_returned_failed() -> Result<()> {
    let h = Harness::new()?;
    h.daemon.reject_next_add("No URI to download.");

    let job = h.orchestrator.enqueue(OWNER, "bogus://", "/x.iso").await?;

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(
        job.error_detail.as_deref(),
        Some("daemon_rejected: add_fetch: No URI to download.")
    );
    assert!(
        h.published()
            .await
            .iter()
            .any(|event| matches!(event, Event::JobFailed { job_id, .. } if *job_id == job.id.as_uuid()))
    );
    Ok(())
}

#[tokio::test]
async fn unreachable_daemon_at_enqueue_fails_the_job_and_degrades_health() -> Result<()> {
    let h = Harness::new()?;
    h.daemon.set_reachable(false);

    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;

    assert_eq!(job.state, JobState::Failed);
    let detail = job.error_detail.context("missing detail")?;
    assert!(detail.starts_with("daemon_rejected: add_fetch: daemon unreachable"), "{detail}");
    assert!(h.orchestrator.is_degraded());
    assert!(h.published().await.iter().any(|event| matches!(
        event,
        Event::HealthChanged { degraded } if degraded == &vec![DAEMON_COMPONENT.to_string()]
    )));
    Ok(())
}

#[tokio::test]
async fn completed_fetch_is_imported_into_the_store() -> Result<()> {
    let h = Harness::new()?;
    let job = h
        .orchestrator
        .enqueue(OWNER, SOURCE, "/isos/debian.iso")
        .await?;
    let artifact = h.write_artifact(&job, "debian.iso", b"iso-bytes")?;
    h.daemon.complete(&daemon_id(&job)?, vec![artifact.clone()]);

    let report = h.orchestrator.poll().await?;

    assert_eq!(report.checked, 1);
    assert_eq!(report.transitioned, 1);
    let done = h.orchestrator.get(job.id).await?;
    assert_eq!(done.state, JobState::Complete);
    assert_eq!(
        h.store.get(OWNER, "/isos/debian.iso"),
        Some(b"iso-bytes".to_vec())
    );
    assert_eq!(h.store.imports(), vec![artifact]);
    assert!(!h.orchestrator.staging_dir(job.id).exists());
    assert!(h.published().await.iter().any(|event| matches!(
        event,
        Event::JobCompleted { job_id, .. } if *job_id == job.id.as_uuid()
    )));
    Ok(())
}

#[tokio::test]
async fn magnet_hand_off_is_tracked_until_the_payload_completes() -> Result<()> {
    let h = Harness::new()?;
    let job = h
        .orchestrator
        .enqueue(OWNER, MAGNET, "/tv/show.mkv")
        .await?;
    let metadata = daemon_id(&job)?;
    let payload = h
        .daemon
        .hand_off(&metadata)
        .context("stub lost the metadata fetch")?;

    let report = h.orchestrator.poll().await?;
    assert_eq!(report.transitioned, 0);
    let following = h.orchestrator.get(job.id).await?;
    assert_eq!(following.state, JobState::Active);
    assert_eq!(following.daemon_id, Some(metadata.clone()));
    assert_eq!(following.tracked_daemon_id(), Some(&payload));
    assert!(h.store.imports().is_empty());

    h.orchestrator.poll().await?;
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Active);

    let artifact = h.write_artifact(&job, "show.mkv", b"episode")?;
    h.daemon.complete(&payload, vec![artifact.clone()]);
    let report = h.orchestrator.poll().await?;
    assert_eq!(report.transitioned, 1);
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Complete);
    assert_eq!(h.store.get(OWNER, "/tv/show.mkv"), Some(b"episode".to_vec()));
    assert_eq!(h.store.imports(), vec![artifact]);
    Ok(())
}

#[tokio::test]
async fn cancelling_after_a_hand_off_aborts_the_follow_up() -> Result<()> {
    let h = Harness::new()?;
    let job = h
        .orchestrator
        .enqueue(OWNER, MAGNET, "/tv/pilot.mkv")
        .await?;
    let payload = h
        .daemon
        .hand_off(&daemon_id(&job)?)
        .context("stub lost the metadata fetch")?;
    h.orchestrator.poll().await?;

    let cancelled = h.orchestrator.cancel(job.id).await?;
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(h.daemon.aborted(), vec![payload]);
    Ok(())
}

#[tokio::test]
async fn daemon_failure_is_recorded() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    h.daemon.fail(&daemon_id(&job)?, "404 Not Found");

    h.orchestrator.poll().await?;

    let failed = h.orchestrator.get(job.id).await?;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.error_detail.as_deref(),
        Some("daemon_failed: 404 Not Found")
    );
    Ok(())
}

#[tokio::test]
async fn pause_and_resume_follow_the_daemon() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    let gid = daemon_id(&job)?;

    h.daemon.set_state(&gid, DaemonState::Paused);
    h.orchestrator.poll().await?;
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Paused);

    h.daemon.set_state(&gid, DaemonState::Active);
    h.orchestrator.poll().await?;
    let resumed = h.orchestrator.get(job.id).await?;
    assert_eq!(resumed.state, JobState::Active);

    let quiet = h.orchestrator.poll().await?;
    assert_eq!(quiet.transitioned, 0);
    let touched = h.orchestrator.get(job.id).await?;
    assert!(touched.last_checked_at >= resumed.last_checked_at);
    assert_eq!(h.metrics.snapshot().active_download_jobs, 1);
    Ok(())
}

#[tokio::test]
async fn failed_import_fails_the_job() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    let artifact = h.write_artifact(&job, "x.iso", b"payload")?;
    h.daemon.complete(&daemon_id(&job)?, vec![artifact]);
    h.store.set_faults(StoreFaults {
        fail_import: true,
        ..StoreFaults::default()
    });

    h.orchestrator.poll().await?;

    let failed = h.orchestrator.get(job.id).await?;
    assert_eq!(failed.state, JobState::Failed);
    let detail = failed.error_detail.context("missing detail")?;
    assert!(detail.starts_with("import_failed"), "{detail}");
    assert_eq!(h.store.get(OWNER, "/x.iso"), None);
    Ok(())
}

#[tokio::test]
async fn job_lost_by_the_daemon_is_reconciled_during_poll() -> Result<()> {
    let h = Harness::new()?;
    let with_artifact = h.orchestrator.enqueue(OWNER, SOURCE, "/a.iso").await?;
    let without = h
        .orchestrator
        .enqueue(OWNER, "https://mirror.example/b.iso", "/b.iso")
        .await?;
    h.write_artifact(&with_artifact, "a.iso", b"aaa")?;
    h.daemon.forget_all();

    let report = h.orchestrator.poll().await?;

    assert_eq!(report.transitioned, 2);
    assert_eq!(
        h.orchestrator.get(with_artifact.id).await?.state,
        JobState::Complete
    );
    assert_eq!(h.store.get(OWNER, "/a.iso"), Some(b"aaa".to_vec()));
    let orphan = h.orchestrator.get(without.id).await?;
    assert_eq!(orphan.state, JobState::Failed);
    assert_eq!(
        orphan.error_detail.as_deref(),
        Some("orphaned: no artifact found")
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_status_calls_time_out_without_changing_state() -> Result<()> {
    let h = Harness::with_settings(|settings| {
        settings.daemon_timeout = Duration::from_millis(200);
    })?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    h.daemon.set_status_delay(Some(Duration::from_secs(5)));

    let report = h.orchestrator.poll().await?;

    assert_eq!(report.checked, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.transitioned, 0);
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Active);
    assert!(h.orchestrator.is_degraded());
    assert_eq!(h.metrics.snapshot().daemon_unreachable_total, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_daemon_backs_off_per_job() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    h.daemon.set_reachable(false);

    h.orchestrator.poll().await?;
    assert_eq!(h.daemon.status_calls(), 1);

    // Inside the first one-second window nothing is asked.
    let waiting = h.orchestrator.poll().await?;
    assert_eq!(waiting.deferred, 1);
    assert_eq!(h.daemon.status_calls(), 1);

    time::advance(Duration::from_secs(1)).await;
    h.orchestrator.poll().await?;
    assert_eq!(h.daemon.status_calls(), 2);

    // Second failure doubles the window.
    time::advance(Duration::from_secs(1)).await;
    h.orchestrator.poll().await?;
    assert_eq!(h.daemon.status_calls(), 2);
    time::advance(Duration::from_secs(1)).await;
    h.orchestrator.poll().await?;
    assert_eq!(h.daemon.status_calls(), 3);

    h.daemon.set_reachable(true);
    time::advance(Duration::from_secs(4)).await;
    let recovered = h.orchestrator.poll().await?;
    assert_eq!(h.daemon.status_calls(), 4);
    assert_eq!(recovered.deferred, 0);
    assert!(!h.orchestrator.is_degraded());
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Active);

    let health: Vec<_> = h
        .published()
        .await
        .into_iter()
        .filter_map(|event| match event {
            Event::HealthChanged { degraded } => Some(degraded),
            _ => None,
        })
        .collect();
    assert_eq!(
        health,
        vec![vec![DAEMON_COMPONENT.to_string()], Vec::<String>::new()]
    );
    Ok(())
}

#[tokio::test]
async fn cancelling_a_running_job_aborts_it() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    let gid = daemon_id(&job)?;

    let cancelled = h.orchestrator.cancel(job.id).await?;

    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.error_detail.as_deref(), Some("cancelled"));
    assert_eq!(h.daemon.aborted(), vec![gid]);

    let again = h.orchestrator.cancel(job.id).await?;
    assert_eq!(again, cancelled);
    assert_eq!(h.daemon.aborted().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancellation_waits_for_an_unreachable_daemon() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    let gid = daemon_id(&job)?;
    h.daemon.set_reachable(false);

    let pending = h.orchestrator.cancel(job.id).await?;
    assert_eq!(pending.state, JobState::Active);
    assert!(pending.cancel_requested);

    let report = h.orchestrator.poll().await?;
    assert_eq!(report.deferred, 1);
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Active);

    h.daemon.set_reachable(true);
    time::advance(Duration::from_secs(1)).await;
    let report = h.orchestrator.poll().await?;
    assert_eq!(report.cancelled, 1);

    let cancelled = h.orchestrator.get(job.id).await?;
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.error_detail.as_deref(), Some("cancelled"));
    assert!(!cancelled.cancel_requested);
    assert_eq!(h.daemon.aborted(), vec![gid]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn pending_cancellation_survives_a_concurrent_poll() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    let gid = daemon_id(&job)?;
    h.daemon.set_status_delay(Some(Duration::from_millis(100)));
    h.daemon.set_abort_reachable(false);

    let orchestrator = Arc::clone(&h.orchestrator);
    let pass = tokio::spawn(async move { orchestrator.poll().await });
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.daemon.status_calls(), 1);

    let pending = h.orchestrator.cancel(job.id).await?;
    assert_eq!(pending.state, JobState::Active);
    assert!(pending.cancel_requested);

    let report = pass.await??;
    assert_eq!(report.checked, 1);
    let stored = h.orchestrator.get(job.id).await?;
    assert_eq!(stored.state, JobState::Active);
    assert!(stored.cancel_requested);

    h.daemon.set_abort_reachable(true);
    let report = h.orchestrator.poll().await?;
    assert_eq!(report.cancelled, 1);
    let cancelled = h.orchestrator.get(job.id).await?;
    assert_eq!(cancelled.state, JobState::Failed);
    assert_eq!(cancelled.error_detail.as_deref(), Some("cancelled"));
    assert_eq!(h.daemon.aborted(), vec![gid]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_hand_off_aborts_the_new_daemon_job() -> Result<()> {
    let h = Harness::new()?;
    h.daemon.set_add_delay(Duration::from_millis(500));
    let orchestrator = Arc::clone(&h.orchestrator);
    let enqueue =
        tokio::spawn(async move { orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await });

    time::sleep(Duration::from_millis(100)).await;
    let queued = h.orchestrator.list_for_owner(OWNER).await?;
    let [job] = queued.as_slice() else {
        anyhow::bail!("expected one queued job, found {}", queued.len());
    };
    assert_eq!(job.state, JobState::Queued);

    let cancelled = h.orchestrator.cancel(job.id).await?;
    assert_eq!(cancelled.state, JobState::Failed);

    let finished = enqueue.await??;
    assert_eq!(finished.state, JobState::Failed);
    assert_eq!(finished.error_detail.as_deref(), Some("cancelled"));
    assert_eq!(h.daemon.add_calls(), 1);
    assert_eq!(h.daemon.aborted().len(), 1);
    Ok(())
}

#[tokio::test]
async fn dismiss_only_removes_finished_jobs() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    h.write_artifact(&job, "x.iso.part", b"partial")?;

    let early = h.orchestrator.dismiss(job.id).await;
    assert!(matches!(
        early,
        Err(OrchestratorError::NotTerminal {
            state: JobState::Active,
            ..
        })
    ));

    h.orchestrator.cancel(job.id).await?;
    let dismissed = h.orchestrator.dismiss(job.id).await?;
    assert_eq!(dismissed.id, job.id);
    assert!(!h.orchestrator.staging_dir(job.id).exists());
    assert!(matches!(
        h.orchestrator.get(job.id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn completed_jobs_are_purged_after_retention() -> Result<()> {
    let h = Harness::with_settings(|settings| {
        settings.completed_retention = Duration::ZERO;
    })?;
    let done = h.orchestrator.enqueue(OWNER, SOURCE, "/done.iso").await?;
    let artifact = h.write_artifact(&done, "done.iso", b"done")?;
    h.daemon.complete(&daemon_id(&done)?, vec![artifact]);
    let failed = h
        .orchestrator
        .enqueue(OWNER, "https://mirror.example/f.iso", "/f.iso")
        .await?;
    h.daemon.fail(&daemon_id(&failed)?, "boom");

    let first = h.orchestrator.poll().await?;
    let second = h.orchestrator.poll().await?;

    assert_eq!(first.purged + second.purged, 1);
    assert!(matches!(
        h.orchestrator.get(done.id).await,
        Err(OrchestratorError::NotFound { .. })
    ));
    assert_eq!(h.orchestrator.get(failed.id).await?.state, JobState::Failed);
    Ok(())
}

#[tokio::test]
async fn recovery_completes_orphans_with_artifacts_and_is_idempotent() -> Result<()> {
    let h = Harness::new()?;
    let finished = h.orchestrator.enqueue(OWNER, SOURCE, "/a.iso").await?;
    let lost = h
        .orchestrator
        .enqueue(OWNER, "https://mirror.example/b.iso", "/b.iso")
        .await?;
    h.write_artifact(&finished, "a.iso", b"aaa")?;
    h.daemon.forget_all();
    let live = h
        .orchestrator
        .enqueue(OWNER, "https://mirror.example/c.iso", "/c.iso")
        .await?;

    let restarted = h.restart();
    let report = restarted.recover_on_startup().await?;

    assert_eq!(
        report,
        RecoveryReport {
            deferred: false,
            resubmitted: 0,
            untouched: 1,
            completed: 1,
            failed: 1,
        }
    );
    assert_eq!(
        restarted.get(finished.id).await?.state,
        JobState::Complete
    );
    assert_eq!(h.store.get(OWNER, "/a.iso"), Some(b"aaa".to_vec()));
    let orphan = restarted.get(lost.id).await?;
    assert_eq!(orphan.state, JobState::Failed);
    assert_eq!(
        orphan.error_detail.as_deref(),
        Some("orphaned: no artifact found")
    );
    assert_eq!(restarted.get(live.id).await?.state, JobState::Active);

    let lost_id = lost.id.as_uuid();
    let trail: Vec<Event> = h
        .published()
        .await
        .into_iter()
        .filter(|event| match event {
            Event::JobStateChanged { job_id, .. } | Event::JobFailed { job_id, .. } => {
                *job_id == lost_id
            }
            _ => false,
        })
        .collect();
    assert!(matches!(
        trail.as_slice(),
        [
            Event::JobStateChanged { state: JobState::Active, .. },
            Event::JobStateChanged { state: JobState::Orphaned, .. },
            Event::JobFailed { .. },
        ]
    ));

    let before: Vec<DownloadJob> = restarted.list_for_owner(OWNER).await?;
    let again = restarted.recover_on_startup().await?;
    assert_eq!(
        again,
        RecoveryReport {
            untouched: 1,
            ..RecoveryReport::default()
        }
    );
    let after: Vec<DownloadJob> = restarted.list_for_owner(OWNER).await?;
    let states = |jobs: &[DownloadJob]| jobs.iter().map(|job| (job.id, job.state)).collect::<Vec<_>>();
    assert_eq!(states(&before), states(&after));
    Ok(())
}

#[tokio::test]
async fn recovery_trusts_files_already_in_the_store() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/a.iso").await?;
    h.daemon.forget_all();
    h.store.put(OWNER, "/a.iso", b"imported before the crash".to_vec());

    let report = h.restart().recover_on_startup().await?;

    assert_eq!(report.completed, 1);
    assert_eq!(h.orchestrator.get(job.id).await?.state, JobState::Complete);
    assert!(h.store.imports().is_empty());
    Ok(())
}

#[tokio::test]
async fn recovery_ignores_partial_downloads() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/a.iso").await?;
    h.write_artifact(&job, "a.iso", b"half")?;
    h.write_artifact(&job, "a.iso.aria2", b"control")?;
    h.daemon.forget_all();

    let report = h.restart().recover_on_startup().await?;

    assert_eq!(report.failed, 1);
    let failed = h.orchestrator.get(job.id).await?;
    assert_eq!(
        failed.error_detail.as_deref(),
        Some("orphaned: no artifact found")
    );
    assert!(h.store.imports().is_empty());
    Ok(())
}

#[tokio::test]
async fn recovery_resubmits_jobs_never_handed_to_the_daemon() -> Result<()> {
    let h = Harness::new()?;
    let queued = h
        .registry()
        .create(DownloadJob::queued(OWNER, SOURCE, "/q.iso"))
        .await?;
    let stale = h
        .registry()
        .create(DownloadJob::queued(OWNER, SOURCE, "/stale.iso"))
        .await?;
    h.registry()
        .assign_daemon_id(stale.id, JobState::Queued, DaemonJobId::new("deadbeef"))
        .await?;

    let restarted = h.restart();
    let report = restarted.recover_on_startup().await?;

    assert_eq!(report.resubmitted, 1);
    assert_eq!(report.failed, 1);
    let resubmitted = restarted.get(queued.id).await?;
    assert_eq!(resubmitted.state, JobState::Active);
    assert_eq!(
        h.daemon.staging_of(&daemon_id(&resubmitted)?),
        Some(restarted.staging_dir(queued.id))
    );
    let interrupted = restarted.get(stale.id).await?;
    assert_eq!(interrupted.state, JobState::Failed);
    assert_eq!(interrupted.error_detail.as_deref(), Some("interrupted"));
    assert_eq!(h.daemon.add_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn recovery_is_deferred_until_the_daemon_answers() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/a.iso").await?;
    h.daemon.forget_all();
    h.daemon.set_reachable(false);

    let restarted = h.restart();
    let report = restarted.recover_on_startup().await?;
    assert!(report.deferred);
    assert_eq!(restarted.get(job.id).await?.state, JobState::Active);

    h.daemon.set_reachable(true);
    let poll = restarted.poll().await?;

    assert_eq!(
        poll.recovery,
        Some(RecoveryReport {
            failed: 1,
            ..RecoveryReport::default()
        })
    );
    assert_eq!(restarted.get(job.id).await?.state, JobState::Failed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn poller_drives_jobs_to_completion() -> Result<()> {
    let h = Harness::new()?;
    let job = h.orchestrator.enqueue(OWNER, SOURCE, "/x.iso").await?;
    let artifact = h.write_artifact(&job, "x.iso", b"payload")?;
    h.daemon.complete(&daemon_id(&job)?, vec![artifact]);

    let poller = h.orchestrator.spawn_poller(Duration::from_secs(1));
    let mut state = JobState::Active;
    for _ in 0..20 {
        time::sleep(Duration::from_millis(500)).await;
        state = h.orchestrator.get(job.id).await?.state;
        if state == JobState::Complete {
            break;
        }
    }
    poller.abort();

    assert_eq!(state, JobState::Complete);
    assert_eq!(h.store.get(OWNER, "/x.iso"), Some(b"payload".to_vec()));
    Ok(())
}
