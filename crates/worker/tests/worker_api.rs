//! Router-level tests for the deployment worker: auth, the query path
//! with guardrail composition, and update validation semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use sha2::{Digest, Sha256};
use tower::util::ServiceExt;
use uuid::Uuid;

use mb_domain::config::WorkerConfig;
use mb_domain::model::ModelType;
use mb_worker::api;
use mb_worker::idle::IdleWatchdog;
use mb_worker::kernel::{Document, ModelKernel, RetrieverKernel, RuleClassifier, TokenClassifier};
use mb_worker::state::{KernelHandle, WorkerState};
use mb_worker::telemetry::TelemetryWriter;
use mb_worker::update_log::UpdateLogger;
use mb_worker::writer::PendingUpdates;

const JOB_TOKEN: &str = "job-secret";

struct TestWorker {
    dir: tempfile::TempDir,
    model_id: Uuid,
    router: Router,
}

fn doc(doc_id: &str, chunks: &[&str]) -> Document {
    Document {
        doc_id: doc_id.to_string(),
        source: format!("{doc_id}.txt"),
        chunks: chunks.iter().map(|c| c.to_string()).collect(),
        metadata: HashMap::new(),
    }
}

fn test_worker(with_guardrail: bool) -> TestWorker {
    let dir = tempfile::tempdir().unwrap();
    let model_id = Uuid::new_v4();
    let artifact = dir.path().join("models").join(model_id.to_string());
    std::fs::create_dir_all(&artifact).unwrap();

    let kernel = RetrieverKernel::load(&artifact).unwrap();
    kernel
        .insert(&[doc(
            "nda",
            &[
                "Confidentiality obligations survive termination of this agreement.",
                "Confidentiality covers all disclosed business information.",
                "The term of this agreement is five years.",
            ],
        )])
        .unwrap();

    let guardrail: Option<Arc<dyn TokenClassifier>> = if with_guardrail {
        let guardrail_dir = dir.path().join("guardrail");
        std::fs::create_dir_all(&guardrail_dir).unwrap();
        std::fs::write(
            guardrail_dir.join("rules.json"),
            serde_json::json!([
                { "tag": "SSN", "pattern": r"\d{3}-\d{2}-\d{4}", "disallowed": true },
            ])
            .to_string(),
        )
        .unwrap();
        Some(Arc::new(RuleClassifier::load(&guardrail_dir).unwrap()))
    } else {
        None
    };

    let config = Arc::new(WorkerConfig {
        model_id,
        model_type: ModelType::Ndb,
        model_bazaar_dir: dir.path().to_path_buf(),
        model_bazaar_endpoint: "http://bazaar.test".into(),
        job_token: JOB_TOKEN.into(),
        nomad_endpoint: "http://scheduler.test".into(),
        task_runner_token: "runner".into(),
        guardrail_id: None,
        llm_base_url: None,
        llm_api_key: None,
        llm_model: None,
        host: "127.0.0.1".into(),
        port: 0,
        idle_shutdown_secs: 900,
        writer_save_interval_secs: 10,
        writer_save_batch_size: 64,
        telemetry_sample_rate: 1,
    });

    let deployment_dir = config.deployment_dir();
    let state = WorkerState {
        config: config.clone(),
        kernel: Arc::new(KernelHandle::new(Arc::new(kernel))),
        guardrail,
        update_log: Arc::new(UpdateLogger::open(&deployment_dir).unwrap()),
        telemetry: Arc::new(TelemetryWriter::open(&deployment_dir, 1)),
        idle: Arc::new(IdleWatchdog::new(Duration::from_secs(900))),
        pending: Arc::new(PendingUpdates::default()),
        llm: None,
        job_token_hash: Arc::new(Sha256::digest(JOB_TOKEN.as_bytes()).to_vec()),
        is_writer: true,
    };

    let router = api::router(state.clone()).with_state(state);
    TestWorker {
        dir,
        model_id,
        router,
    }
}

async fn call(
    worker: &TestWorker,
    path: &str,
    token: Option<&str>,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(format!("/{}/{path}", worker.model_id))
        .header("content-type", "application/json");
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {token}"));
    }
    let response = worker
        .router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn predict_returns_ranked_references() {
    let worker = test_worker(false);
    let (status, body) = call(
        &worker,
        "predict",
        Some(JOB_TOKEN),
        serde_json::json!({ "query": "confidentiality", "top_k": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let references = body["data"]["references"].as_array().unwrap();
    assert_eq!(references.len(), 2);
    assert!(references[0]["text"]
        .as_str()
        .unwrap()
        .to_lowercase()
        .contains("confidentiality"));
}

#[tokio::test]
async fn predict_can_generate_a_grounded_answer() {
    let mut worker = test_worker(false);
    // Rebuild the router with a stub answer generator attached.
    worker.router = {
        let mut state = replica_state(&worker);
        state.llm = Some(Arc::new(mb_llm::testing::StubLlm::new(
            "The obligations survive termination.",
        )));
        api::router(state.clone()).with_state(state)
    };

    let (status, body) = call(
        &worker,
        "predict",
        Some(JOB_TOKEN),
        serde_json::json!({ "query": "confidentiality", "top_k": 2, "generate_answer": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["answer"], "The obligations survive termination.");

    // Without the flag, no answer is generated.
    let (_, body) = call(
        &worker,
        "predict",
        Some(JOB_TOKEN),
        serde_json::json!({ "query": "confidentiality" }),
    )
    .await;
    assert!(body["data"]["answer"].is_null());
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let worker = test_worker(false);
    let (status, _) = call(
        &worker,
        "predict",
        Some("wrong"),
        serde_json::json!({ "query": "q" }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&worker, "predict", None, serde_json::json!({ "query": "q" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn guardrail_redacts_before_retrieval() {
    let worker = test_worker(true);
    let (status, body) = call(
        &worker,
        "predict",
        Some(JOB_TOKEN),
        serde_json::json!({ "query": "confidentiality for 123-45-6789", "top_k": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"]["query"],
        "confidentiality for [REDACTED]",
        "the redacted query is what retrieval saw"
    );
}

#[tokio::test]
async fn valid_insert_is_logged_not_applied() {
    let worker = test_worker(false);
    let staged = worker.dir.path().join("new_doc.txt");
    std::fs::write(&staged, "More contract language here.").unwrap();

    let (status, body) = call(
        &worker,
        "insert",
        Some(JOB_TOKEN),
        serde_json::json!({ "documents": [{ "path": staged.display().to_string(), "location": "local" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["doc_ids"].as_array().unwrap().len(), 1);

    // The record is durable in this replica's insertions log.
    let log_dir = worker.dir.path().join("deployments").join(worker.model_id.to_string()).join("insertions");
    let log_file = std::fs::read_dir(&log_dir).unwrap().next().unwrap().unwrap();
    let content = std::fs::read_to_string(log_file.path()).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains("new_doc.txt"));

    // Replicas do not mutate the model: a fresh predict still sees only
    // the original three chunks.
    let (_, body) = call(
        &worker,
        "predict",
        Some(JOB_TOKEN),
        serde_json::json!({ "query": "contract language", "top_k": 5 }),
    )
    .await;
    assert!(body["data"]["references"]
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["doc_id"] == "nda"));
}

#[tokio::test]
async fn bad_insert_is_rejected_and_never_logged() {
    let worker = test_worker(false);
    let exe = worker.dir.path().join("payload.exe");
    std::fs::write(&exe, b"MZ").unwrap();

    let (status, body) = call(
        &worker,
        "insert",
        Some(JOB_TOKEN),
        serde_json::json!({ "documents": [{ "path": exe.display().to_string(), "location": "local" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let log_dir = worker
        .dir
        .path()
        .join("deployments")
        .join(worker.model_id.to_string())
        .join("insertions");
    let log_file = std::fs::read_dir(&log_dir).unwrap().next().unwrap().unwrap();
    assert_eq!(std::fs::read_to_string(log_file.path()).unwrap(), "");
}

#[tokio::test]
async fn upvote_and_associate_validate_shapes() {
    let worker = test_worker(false);

    let (status, _) = call(
        &worker,
        "upvote",
        Some(JOB_TOKEN),
        serde_json::json!({ "chunk_ids": [], "queries": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &worker,
        "associate",
        Some(JOB_TOKEN),
        serde_json::json!({ "sources": ["a"], "targets": ["b", "c"] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &worker,
        "upvote",
        Some(JOB_TOKEN),
        serde_json::json!({ "chunk_ids": [0], "queries": ["confidentiality"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn save_is_writer_only() {
    let worker = test_worker(false);
    let (status, _) = call(&worker, "save", Some(JOB_TOKEN), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);

    // The same artifact served by a read replica refuses to save.
    let replica_router = {
        let state = replica_state(&worker);
        api::router(state.clone()).with_state(state)
    };
    let replica = TestWorker {
        dir: worker.dir,
        model_id: worker.model_id,
        router: replica_router,
    };
    let (status, body) = call(&replica, "save", Some(JOB_TOKEN), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED, "{body}");
}

/// A clone of the worker's state with `is_writer = false`.
fn replica_state(worker: &TestWorker) -> WorkerState {
    let artifact = worker
        .dir
        .path()
        .join("models")
        .join(worker.model_id.to_string());
    let config = Arc::new(WorkerConfig {
        model_id: worker.model_id,
        model_type: ModelType::Ndb,
        model_bazaar_dir: worker.dir.path().to_path_buf(),
        model_bazaar_endpoint: "http://bazaar.test".into(),
        job_token: JOB_TOKEN.into(),
        nomad_endpoint: "http://scheduler.test".into(),
        task_runner_token: "runner".into(),
        guardrail_id: None,
        llm_base_url: None,
        llm_api_key: None,
        llm_model: None,
        host: "127.0.0.1".into(),
        port: 0,
        idle_shutdown_secs: 900,
        writer_save_interval_secs: 10,
        writer_save_batch_size: 64,
        telemetry_sample_rate: 1,
    });
    let deployment_dir = config.deployment_dir();
    let kernel: Arc<dyn ModelKernel> = Arc::new(RetrieverKernel::load(&artifact).unwrap());
    WorkerState {
        config: config.clone(),
        kernel: Arc::new(KernelHandle::new(kernel)),
        guardrail: None,
        update_log: Arc::new(UpdateLogger::open(&deployment_dir).unwrap()),
        telemetry: Arc::new(TelemetryWriter::open(&deployment_dir, 1)),
        idle: Arc::new(IdleWatchdog::new(Duration::from_secs(900))),
        pending: Arc::new(PendingUpdates::default()),
        llm: None,
        job_token_hash: Arc::new(Sha256::digest(JOB_TOKEN.as_bytes()).to_vec()),
        is_writer: false,
    }
}
