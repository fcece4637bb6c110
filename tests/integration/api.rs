use crate::*;

use orca_api::ApiState;
use orca_services::{NetProber, PeerDirectory};
use serde_json::{json, Value};

/// Serve the consumer's job surface on a loopback port.
async fn serve(net: &MemoryDht, c: &Consumer) -> String {
    let directory = Arc::new(PeerDirectory::new(
        Arc::new(net.clone()),
        Arc::new(NetProber::new(Duration::from_millis(500), false)),
    ));
    let state = ApiState {
        jobs: c.jobs.clone(),
        runner: c.runner.clone(),
        market: c.market.clone(),
        store: ChunkStore::new(c.work.join("store"), 1024).unwrap(),
        directory,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = orca_api::router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// The whole download driven through HTTP: add, start, poll, inspect.
#[tokio::test]
async fn test_download_over_http() -> Result<()> {
    let net = network();
    let data = sample(5000);
    let p = producer(&net, &data, 1024, 4).await;
    let c = consumer(&net, Duration::ZERO).await;
    let base = serve(&net, &c).await;
    let http = reqwest::Client::new();

    let holders: Value = http
        .get(format!("{base}/holders?fileHash={}", p.manifest.file_hash))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(holders[0]["peerId"], p.identity.peer_id());
    assert_eq!(holders[0]["price"], 4);

    let added: Value = http
        .put(format!("{base}/add-job"))
        .json(&json!({ "fileHash": p.manifest.file_hash, "peer": "" }))
        .send()
        .await?
        .json()
        .await?;
    let id = added["jobID"].as_str().unwrap_or_default().to_string();
    assert!(!id.is_empty());

    let started = http
        .patch(format!("{base}/start-jobs"))
        .json(&json!([{ "jobID": id }]))
        .send()
        .await?;
    assert!(started.status().is_success());

    let mut info = Value::Null;
    for _ in 0..400 {
        info = http
            .get(format!("{base}/job-info?jobID={id}"))
            .send()
            .await?
            .json()
            .await?;
        if info["status"] == "finished" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(info["status"], "finished");
    assert_eq!(info["accumulatedCost"], 20);
    assert_eq!(info["fileHash"], p.manifest.file_hash.as_str());
    assert_eq!(c.downloaded(&p.manifest.file_hash), data);

    let summary: Value = http
        .get(format!(
            "{base}/job-peer?fileHash={}&peer={}",
            p.manifest.file_hash,
            p.identity.peer_id()
        ))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(summary["jobID"], id.as_str());
    assert_eq!(summary["accumulatedCost"], 20);

    let cleared: Value = http
        .patch(format!("{base}/clear-history"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(cleared["removed"], 1);
    let list: Value = http.get(format!("{base}/job-list")).send().await?.json().await?;
    assert_eq!(list.as_array().map(Vec::len), Some(0));
    Ok(())
}

/// Starting a job that does not exist is a 400 with the id in the error list.
#[tokio::test]
async fn test_start_unknown_job_over_http() -> Result<()> {
    let net = network();
    let c = consumer(&net, Duration::ZERO).await;
    let base = serve(&net, &c).await;

    let resp = reqwest::Client::new()
        .patch(format!("{base}/start-jobs"))
        .json(&json!([{ "jobID": "missing" }]))
        .send()
        .await?;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await?;
    assert!(body["errors"][0]
        .as_str()
        .unwrap_or_default()
        .contains("missing"));
    Ok(())
}
