use std::io::Write;

use orca_services::jobs::TERMINATED_BY_REQUEST;

use crate::*;

const PAY_DELAY: Duration = Duration::from_millis(15);

/// Pause holds the transfer between chunks; start picks it up from there.
#[tokio::test]
async fn test_pause_then_resume() -> Result<()> {
    let net = network();
    let data = sample(120 * 256);
    let p = producer(&net, &data, 256, 1).await;
    let c = consumer(&net, PAY_DELAY).await;
    let hash = p.manifest.file_hash.clone();

    let job = c.jobs.add_job(&hash, "").await;
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    wait_until(&c.jobs, &job.job_id, "started", |j| j.next_chunk >= 3).await?;

    c.jobs.pause_job(&job.job_id).await?;
    // One chunk may already be in flight when the pause lands.
    tokio::time::sleep(PAY_DELAY * 3).await;
    let held = c.jobs.find_job(&job.job_id).await?;
    assert_eq!(held.status, JobStatus::Paused);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let still = c.jobs.find_job(&job.job_id).await?;
    assert_eq!(still.next_chunk, held.next_chunk);
    assert_eq!(still.accumulated_cost, held.accumulated_cost);
    assert!(held.next_chunk < 120);
    assert!(c.runner.is_running(&job.job_id));

    assert!(c.runner.start_jobs(&[job.job_id.clone()]).await.is_empty());
    let done = wait_for_status(&c.jobs, &job.job_id, JobStatus::Finished).await?;
    assert_eq!(done.accumulated_cost, 120);
    assert_eq!(c.downloaded(&hash), data);
    assert_eq!(c.ledger_lines(), 120);
    Ok(())
}

/// Terminate stops the transfer and freezes its cost.
#[tokio::test]
async fn test_terminate_mid_transfer() -> Result<()> {
    let net = network();
    let data = sample(120 * 256);
    let p = producer(&net, &data, 256, 2).await;
    let c = consumer(&net, PAY_DELAY).await;
    let hash = p.manifest.file_hash.clone();

    let job = c.jobs.add_job(&hash, "").await;
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    wait_until(&c.jobs, &job.job_id, "started", |j| j.next_chunk >= 2).await?;

    assert_eq!(
        c.jobs.terminate_job(&job.job_id).await?,
        JobStatus::Terminated
    );
    tokio::time::sleep(PAY_DELAY * 4).await;
    let stopped = c.jobs.find_job(&job.job_id).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let later = c.jobs.find_job(&job.job_id).await?;

    assert_eq!(later.status, JobStatus::Terminated);
    assert_eq!(later.last_error.as_deref(), Some(TERMINATED_BY_REQUEST));
    assert_eq!(later.accumulated_cost, stopped.accumulated_cost);
    assert!(later.next_chunk < 120);
    assert!(!c.runner.is_running(&job.job_id));
    assert!(file_len(&c.runner.destination(&hash)) < data.len() as u64);

    // Terminal jobs cannot be restarted.
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    assert_eq!(
        c.jobs.find_job(&job.job_id).await?.status,
        JobStatus::Terminated
    );
    Ok(())
}

/// A paused job survives a restart and resumes from its saved chunk, even
/// when the file on disk ran ahead of the saved history.
#[tokio::test]
async fn test_resume_after_restart() -> Result<()> {
    let net = network();
    let data = sample(80 * 256);
    let p = producer(&net, &data, 256, 1).await;
    let first = consumer(&net, PAY_DELAY).await;
    let hash = p.manifest.file_hash.clone();

    let job = first.jobs.add_job(&hash, "").await;
    first.runner.start_jobs(&[job.job_id.clone()]).await;
    wait_until(&first.jobs, &job.job_id, "started", |j| j.next_chunk >= 5).await?;
    first.jobs.pause_job(&job.job_id).await?;
    tokio::time::sleep(PAY_DELAY * 3).await;
    assert!(first.jobs.save().await?);
    let saved = first.jobs.find_job(&job.job_id).await?;

    // New process: same work dir, history reloaded from disk.
    let work = first.work.clone();
    let jobs = Arc::new(JobManager::load(work.join("jobs.json")).await?);
    let reloaded = jobs.find_job(&job.job_id).await?;
    assert_eq!(reloaded.status, JobStatus::Paused);
    assert_eq!(reloaded.next_chunk, saved.next_chunk);
    assert_eq!(reloaded.bytes_received, saved.next_chunk * 256);

    // A chunk that landed after the save.
    let dest = first.runner.destination(&hash);
    std::fs::OpenOptions::new()
        .append(true)
        .open(&dest)?
        .write_all(&data[..256])?;

    let second = consumer_with_jobs(&net, work, jobs, Duration::ZERO);
    second.runner.start_jobs(&[job.job_id.clone()]).await;
    let done = wait_for_status(&second.jobs, &job.job_id, JobStatus::Finished).await?;
    assert_eq!(done.accumulated_cost, 80);
    assert_eq!(second.downloaded(&hash), data);
    Ok(())
}
