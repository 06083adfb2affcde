use std::path::PathBuf;
use std::sync::Arc;

use locate_api::app::AppServices;
use locate_infra::config::LocateConfig;
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    upload_dir: PathBuf,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let upload_dir = std::env::temp_dir().join(format!("locate-api-{}", uuid::Uuid::now_v7()));
        let config = LocateConfig {
            upload_dir: upload_dir.clone(),
            workers: 2,
            ..LocateConfig::default()
        };

        // Same router as prod, bound to an ephemeral port.
        let (app, services) = locate_api::app::build_app(&config).await.unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            upload_dir,
            services,
            handle,
        }
    }

    fn write_image(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.upload_dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        self.services.shutdown();
        let _ = std::fs::remove_dir_all(&self.upload_dir);
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> serde_json::Value {
    let res = client.post(srv.url("/jobs")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn job_eventually_terminal(client: &reqwest::Client, srv: &TestServer, id: &str) -> serde_json::Value {
    // Jobs run on background workers; poll until one finishes.
    for _ in 0..200 {
        let res = client.get(srv.url(&format!("/jobs/{id}"))).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if body["status"] == "completed" || body["status"] == "failed" {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    panic!("job {id} did not finish within timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn job_lifecycle_completes_with_ranked_predictions() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let path = srv.write_image("street.jpg", b"a photo of a street corner");

    let created = submit(&client, &srv, json!({ "file_path": path, "top_k": 4 })).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["filename"], "street.jpg");
    assert!(created.get("file_path").is_none());

    let job = job_eventually_terminal(&client, &srv, created["id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed");
    assert!(job["error"].is_null());
    assert_eq!(job["device"], "cpu");

    let results = job["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    for (i, p) in results.iter().enumerate() {
        assert_eq!(p["rank"].as_u64().unwrap(), i as u64 + 1);
        assert_eq!(p["location_summary"], "");
    }
    let probs: Vec<f64> = results.iter().map(|p| p["probability"].as_f64().unwrap()).collect();
    assert!(probs.windows(2).all(|w| w[0] >= w[1]));

    for field in ["created_at", "started_at", "completed_at"] {
        let ts = job[field].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "{field}: {ts}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_file_fails_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let path = srv.upload_dir.join("never-written.jpg");

    let created = submit(&client, &srv, json!({ "file_path": path, "top_k": 5 })).await;
    let job = job_eventually_terminal(&client, &srv, created["id"].as_str().unwrap()).await;

    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().unwrap().contains("does not exist"));
    assert!(job["results"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_image_fails_with_no_predictions() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let path = srv.write_image("blank.png", b"");

    let created = submit(&client, &srv, json!({ "file_path": path })).await;
    let job = job_eventually_terminal(&client, &srv, created["id"].as_str().unwrap()).await;

    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"], "no predictions generated");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let path = srv.write_image("a.jpg", b"x");

    let res = client
        .post(srv.url("/jobs"))
        .json(&json!({ "file_path": path, "top_k": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client.get(srv.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client.get(srv.url("/jobs?status=running")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url(&format!("/jobs/{}", uuid::Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn paths_outside_upload_dir_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let outside = std::env::temp_dir().join(format!("locate-outside-{}.txt", uuid::Uuid::now_v7()));
    std::fs::write(&outside, b"must survive").unwrap();

    let res = client
        .post(srv.url("/jobs"))
        .json(&json!({ "file_path": outside }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let traversal = format!("../{}", outside.file_name().unwrap().to_string_lossy());
    let res = client
        .post(srv.url("/jobs"))
        .json(&json!({ "file_path": traversal }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(srv.url("/infer"))
        .json(&json!({ "items": [{ "path": outside }], "skip_missing": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = client
        .post(srv.url("/jobs/batch"))
        .json(&json!({ "paths": ["/etc/passwd.jpg"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["created"].as_array().unwrap().is_empty());
    assert_eq!(body["rejected"].as_array().unwrap().len(), 1);

    let stats: serde_json::Value = client.get(srv.url("/jobs/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["pending"], 0);
    assert!(outside.exists());
    let _ = std::fs::remove_file(&outside);
}

#[tokio::test(flavor = "multi_thread")]
async fn relative_paths_resolve_inside_upload_dir() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.write_image("relative.jpg", b"relative pixels");

    let created = submit(&client, &srv, json!({ "file_path": "relative.jpg" })).await;
    let job = job_eventually_terminal(&client, &srv, created["id"].as_str().unwrap()).await;
    assert_eq!(job["status"], "completed");

    let res = client
        .delete(srv.url(&format!("/jobs/{}", created["id"].as_str().unwrap())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(!srv.upload_dir.join("relative.jpg").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn list_stats_and_delete() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let mut ids = Vec::new();
    for i in 0..3 {
        let path = srv.write_image(&format!("{i}.jpg"), format!("image {i}").as_bytes());
        let created = submit(&client, &srv, json!({ "file_path": path })).await;
        ids.push(created["id"].as_str().unwrap().to_string());
    }
    for id in &ids {
        job_eventually_terminal(&client, &srv, id).await;
    }

    let listed: Vec<serde_json::Value> = client
        .get(srv.url("/jobs?status=completed&limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    // Newest first.
    assert_eq!(listed[0]["id"], ids[2].as_str());

    let stats: serde_json::Value = client.get(srv.url("/jobs/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["completed"], 3);
    assert_eq!(stats["pending"], 0);

    let res = client.delete(srv.url(&format!("/jobs/{}", ids[0]))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(!srv.upload_dir.join("0.jpg").exists());

    let res = client.get(srv.url(&format!("/jobs/{}", ids[0]))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = client.delete(srv.url(&format!("/jobs/{}", ids[0]))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_submission_reports_rejected_paths() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let good = srv.write_image("good.jpeg", b"good");
    let bad = srv.write_image("notes.txt", b"not an image");

    let res = client
        .post(srv.url("/jobs/batch"))
        .json(&json!({ "paths": [good, bad], "top_k": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();

    let created = body["created"].as_array().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["top_k"], 2);
    let rejected = body["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0]["reason"].as_str().unwrap().contains("unsupported"));

    let too_many: Vec<String> = (0..101).map(|i| format!("/x/{i}.jpg")).collect();
    let res = client
        .post(srv.url("/jobs/batch"))
        .json(&json!({ "paths": too_many }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn infer_skips_missing_files_when_asked() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let present = srv.write_image("here.jpg", b"pixels");
    let missing = srv.upload_dir.join("gone.jpg");

    let res = client
        .post(srv.url("/infer"))
        .json(&json!({
            "items": [
                { "path": present, "md5": "abc123" },
                { "path": missing },
            ],
            "top_k": 3,
            "skip_missing": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();

    assert_eq!(body["device"], "cpu");
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);

    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["md5"], "abc123");
    assert_eq!(results[0]["predictions"].as_array().unwrap().len(), 3);

    assert_eq!(results[1]["status"], "skipped");
    assert!(results[1]["error"].is_null());
    assert!(results[1]["predictions"].as_array().unwrap().is_empty());
    assert_eq!(results[1]["warnings"].as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn infer_without_skip_reports_sanitized_error() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let missing = srv.upload_dir.join("secret-location.jpg");

    let body: serde_json::Value = client
        .post(srv.url("/infer"))
        .json(&json!({ "items": [{ "path": missing }] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let result = &body["results"][0];
    assert_eq!(result["status"], "failed");
    assert_eq!(result["error"], "file does not exist");
}

#[tokio::test(flavor = "multi_thread")]
async fn model_status_reflects_lazy_load() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let status: serde_json::Value = client.get(srv.url("/model")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["loaded"], false);
    assert_eq!(status["loads"], 0);
    assert_eq!(status["idle_timeout_secs"], 600);

    let path = srv.write_image("load.jpg", b"trigger a load");
    let res = client
        .post(srv.url("/infer"))
        .json(&json!({ "items": [{ "path": path }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let status: serde_json::Value = client.get(srv.url("/model")).send().await.unwrap().json().await.unwrap();
    assert_eq!(status["loaded"], true);
    assert_eq!(status["device"], "cpu");
    assert_eq!(status["loads"], 1);
}
