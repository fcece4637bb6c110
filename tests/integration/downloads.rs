use crate::*;

/// Share, look up, download: the file arrives byte-identical and every chunk is paid.
#[tokio::test]
async fn test_register_lookup_download() -> Result<()> {
    let net = network();
    let data = sample(10 * 1024 + 300);
    let p = producer(&net, &data, 1024, 3).await;
    let c = consumer(&net, Duration::ZERO).await;

    let holders = c.market.lookup(&p.manifest.file_hash).await?;
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].port, p.port);
    assert!(routing_has(&net, &p.identity.peer_id()).await);

    let job = c.jobs.add_job(&p.manifest.file_hash, "").await;
    assert!(c.runner.start_jobs(&[job.job_id.clone()]).await.is_empty());

    let done = wait_for_status(&c.jobs, &job.job_id, JobStatus::Finished).await?;
    assert_eq!(c.downloaded(&p.manifest.file_hash), data);
    assert_eq!(done.max_chunks, 11);
    assert_eq!(done.accumulated_cost, 33);
    assert_eq!(done.projected_cost, 33);
    assert_eq!(done.peer_id, p.identity.peer_id());
    assert_eq!(c.ledger_lines(), 11);
    Ok(())
}

/// With two holders and no peer named, the cheaper one serves the job.
#[tokio::test]
async fn test_cheapest_holder_is_used() -> Result<()> {
    let net = network();
    let data = sample(4096);
    let pricey = producer(&net, &data, 1024, 10).await;
    let cheap = producer(&net, &data, 1024, 2).await;
    assert_eq!(pricey.manifest.file_hash, cheap.manifest.file_hash);

    let c = consumer(&net, Duration::ZERO).await;
    assert_eq!(c.market.lookup(&cheap.manifest.file_hash).await?.len(), 2);

    let job = c.jobs.add_job(&cheap.manifest.file_hash, "").await;
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    let done = wait_for_status(&c.jobs, &job.job_id, JobStatus::Finished).await?;
    assert_eq!(done.peer_id, cheap.identity.peer_id());
    assert_eq!(done.accumulated_cost, 8);
    assert_eq!(c.downloaded(&cheap.manifest.file_hash), data);
    Ok(())
}

/// A job naming a specific holder is served by that holder even if it costs more.
#[tokio::test]
async fn test_named_holder_is_used() -> Result<()> {
    let net = network();
    let data = sample(2048);
    let pricey = producer(&net, &data, 1024, 10).await;
    let _cheap = producer(&net, &data, 1024, 2).await;

    let c = consumer(&net, Duration::ZERO).await;
    let job = c
        .jobs
        .add_job(&pricey.manifest.file_hash, &pricey.identity.peer_id())
        .await;
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    let done = wait_for_status(&c.jobs, &job.job_id, JobStatus::Finished).await?;
    assert_eq!(done.accumulated_cost, 20);
    Ok(())
}

/// Empty files are one empty chunk and download as an empty file.
#[tokio::test]
async fn test_empty_file_download() -> Result<()> {
    let net = network();
    let p = producer(&net, b"", 1024, 1).await;
    let c = consumer(&net, Duration::ZERO).await;

    let job = c.jobs.add_job(&p.manifest.file_hash, "").await;
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    let done = wait_for_status(&c.jobs, &job.job_id, JobStatus::Finished).await?;
    assert_eq!(done.max_chunks, 1);
    assert!(c.runner.destination(&p.manifest.file_hash).exists());
    assert!(c.downloaded(&p.manifest.file_hash).is_empty());
    Ok(())
}

/// A file nobody shares terminates the job with a reason.
#[tokio::test]
async fn test_unshared_file_terminates() -> Result<()> {
    let net = network();
    let c = consumer(&net, Duration::ZERO).await;
    let hash = orca_core::crypto::file_hash_bytes(b"never shared");

    let job = c.jobs.add_job(&hash, "").await;
    c.runner.start_jobs(&[job.job_id.clone()]).await;
    let failed = wait_for_status(&c.jobs, &job.job_id, JobStatus::Terminated).await?;
    assert!(failed.last_error.is_some());
    assert_eq!(c.ledger_lines(), 0);
    Ok(())
}

/// Asking past the end gets the real chunk count back and nothing is paid.
#[tokio::test]
async fn test_resume_point_past_end_is_out_of_range() -> Result<()> {
    let net = network();
    let data = sample(3000);
    let p = producer(&net, &data, 1024, 1).await;
    let c = consumer(&net, Duration::ZERO).await;

    let job = c.jobs.add_job(&p.manifest.file_hash, "").await;
    let dest = c.runner.destination(&p.manifest.file_hash);
    std::fs::create_dir_all(dest.parent().unwrap())?;
    std::fs::write(&dest, &data)?;
    c.jobs.record_progress(&job.job_id, 9, 0, 3000, 0).await?;
    c.runner.start_jobs(&[job.job_id.clone()]).await;

    let failed = wait_for_status(&c.jobs, &job.job_id, JobStatus::Terminated).await?;
    let reason = failed.last_error.unwrap_or_default();
    assert!(reason.contains("out of range"), "{reason}");
    assert!(reason.contains('3'), "{reason}");
    assert_eq!(c.ledger_lines(), 0);
    Ok(())
}
