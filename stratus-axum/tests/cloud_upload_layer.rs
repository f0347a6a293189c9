use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Extension, Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use stratus_axum::{CloudUploadLayer, UploadOutcome, UploadPathOverride, WaitForRemote};
use stratus_upload::{KeepOriginalName, MemoryAssetStore, MemoryStore, UploadConfig, UploadOrchestrator};

const BOUNDARY: &str = "stratus-test-boundary";

enum Part<'a> {
    Field(&'a str, &'a str),
    File(&'a str, &'a str, &'a str),
}

fn multipart_body(parts: &[Part<'_>]) -> String {
    let mut body = String::new();
    for part in parts {
        body.push_str(&format!("--{}\r\n", BOUNDARY));
        match part {
            Part::Field(name, value) => {
                body.push_str(&format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name));
                body.push_str(value);
            }
            Part::File(name, filename, content) => {
                body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, filename
                ));
                body.push_str("Content-Type: text/plain\r\n\r\n");
                body.push_str(content);
            }
        }
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));
    body
}

fn multipart_request(body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(body))
        .unwrap()
}

fn config() -> UploadConfig {
    UploadConfig::default()
        .with_upload_directory("up")
        .with_timestamp_in_dir(false)
}

fn router(orchestrator: UploadOrchestrator) -> Router {
    Router::new()
        .route("/upload", post(|body: String| async move { format!("handler saw: {}", body) }))
        .layer(CloudUploadLayer::new(orchestrator))
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn text_body(res: axum::response::Response) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn multipart_uploads_respond_with_summary() {
    let store = MemoryStore::new();
    let orchestrator = UploadOrchestrator::new(store.clone(), config()).with_naming(KeepOriginalName);

    let body = multipart_body(&[
        Part::Field("title", "quarterly"),
        Part::File("report", "report.txt", "numbers go up"),
    ]);
    let res = router(orchestrator).oneshot(multipart_request(body)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["fields"]["title"], "quarterly");
    assert_eq!(body["fields"]["report"], "report.txt");
    assert_eq!(body["files"][0]["size"], 13);
    assert_eq!(body["files"][0]["key"], "up/report.txt");
    assert_eq!(body["files"][0]["remote"]["status"], "stored");
    assert_eq!(body["remote_uploads"].as_array().unwrap().len(), 1);
    assert_eq!(body["assets"], json!([]));

    assert_eq!(&store.object("up/report.txt").unwrap().data[..], b"numbers go up");
}

#[tokio::test]
async fn non_multipart_requests_pass_through() {
    let store = MemoryStore::new();
    let orchestrator = UploadOrchestrator::new(store.clone(), config());

    let res = router(orchestrator)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload")
                .header("content-type", "application/json")
                .body(Body::from("{\"plain\":true}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(text_body(res).await, "handler saw: {\"plain\":true}");
    assert_eq!(store.sinks_opened(), 0);
}

#[tokio::test]
async fn handoff_mode_forwards_outcome_to_handler() {
    let orchestrator =
        UploadOrchestrator::new(MemoryStore::new(), config().with_send_response(false)).with_naming(KeepOriginalName);

    let app = Router::new()
        .route(
            "/upload",
            post(|Extension(outcome): Extension<UploadOutcome>, Json(fields): Json<Value>| async move {
                Json(json!({
                    "files": outcome.snapshot.files.len(),
                    "title": fields["title"],
                }))
            }),
        )
        .layer(CloudUploadLayer::new(orchestrator));

    let body = multipart_body(&[Part::Field("title", "t"), Part::File("doc", "a.txt", "abc")]);
    let res = app.oneshot(multipart_request(body)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["files"], 1);
    assert_eq!(body["title"], "t");
}

#[tokio::test]
async fn request_extensions_override_upload_behavior() {
    let orchestrator = UploadOrchestrator::new(MemoryStore::new(), config()).with_naming(KeepOriginalName);

    let app = Router::new()
        .route("/upload", post(|| async { "unused" }))
        .layer(CloudUploadLayer::new(orchestrator))
        .layer(Extension(UploadPathOverride("tenants/42".to_string())))
        .layer(Extension(WaitForRemote(true)));

    let body = multipart_body(&[Part::File("doc", "a.txt", "abc")]);
    let res = app.oneshot(multipart_request(body)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["files"][0]["key"], "tenants/42/a.txt");
    assert_eq!(body["files"][0]["remote"]["status"], "stored");
}

#[tokio::test]
async fn malformed_multipart_returns_bad_request() {
    let store = MemoryStore::new();
    let orchestrator = UploadOrchestrator::new(store.clone(), config());

    let truncated = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nno closing boundary",
        BOUNDARY
    );
    let res = router(orchestrator).oneshot(multipart_request(truncated)).await.unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body = json_body(res).await;
    assert_eq!(body["name"], "BadRequest");
    assert_eq!(body["code"], 400);
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn truncated_file_fails_only_that_file() {
    let store = MemoryStore::new();
    let orchestrator = UploadOrchestrator::new(store.clone(), config().with_wait_for_remote(true))
        .with_naming(KeepOriginalName);

    let truncated = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nt\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\r\ncut short",
        b = BOUNDARY
    );
    let res = router(orchestrator).oneshot(multipart_request(truncated)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["fields"]["title"], "t");
    assert!(body["files"][0]["error"].is_string());
    assert_eq!(body["files"][0]["remote"]["status"], "failed");
    assert!(store.keys().is_empty());
    assert_eq!(store.sinks_open(), 0);
}

#[tokio::test]
async fn assets_are_created_when_enabled() {
    let assets = MemoryAssetStore::new();
    let orchestrator = UploadOrchestrator::new(MemoryStore::new(), config().with_save_file_to_asset(true))
        .with_naming(KeepOriginalName)
        .with_materializer(assets.clone());

    let body = multipart_body(&[Part::Field("title", "t"), Part::File("doc", "a.txt", "abc")]);
    let res = router(orchestrator).oneshot(multipart_request(body)).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body = json_body(res).await;
    assert_eq!(body["assets"][0]["original_filename"], "a.txt");
    assert_eq!(body["assets"][0]["body"]["title"], "t");
    assert_eq!(assets.records().len(), 1);
}

#[tokio::test]
async fn asset_persistence_failures_return_server_error() {
    let orchestrator = UploadOrchestrator::new(MemoryStore::new(), config().with_save_file_to_asset(true))
        .with_materializer(MemoryAssetStore::failing("db down"));

    let body = multipart_body(&[Part::File("doc", "a.txt", "abc")]);
    let res = router(orchestrator).oneshot(multipart_request(body)).await.unwrap();

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(res).await;
    assert_eq!(body["name"], "GeneralError");
    assert!(body["message"].as_str().unwrap().contains("db down"));
}
