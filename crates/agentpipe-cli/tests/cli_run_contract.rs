use axum::{routing::post, Json, Router};
use serde_json::json;
use std::net::SocketAddr;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn run(base_url: String, args: Vec<&'static str>) -> (bool, serde_json::Value) {
    tokio::task::spawn_blocking(move || {
        let bin = assert_cmd::cargo::cargo_bin!("agentpipe");
        let out = std::process::Command::new(bin)
            .arg("run")
            .args(&args)
            .env("AGENTPIPE_OPENAI_COMPAT_BASE_URL", base_url)
            .env("AGENTPIPE_OPENAI_COMPAT_MODEL", "stub-model")
            .env_remove("AGENTPIPE_OPENAI_COMPAT_API_KEY")
            .env_remove("AGENTPIPE_ENV_FILE")
            .output()
            .expect("run agentpipe run");
        let s = String::from_utf8_lossy(&out.stdout);
        let v: serde_json::Value = serde_json::from_str(s.trim()).expect("parse run json");
        (out.status.success(), v)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn whitespace_task_is_empty_task() {
    // Nothing listens on port 9; the task must be rejected before any request.
    let (ok, v) = run("http://127.0.0.1:9".to_string(), vec!["   "]).await;
    assert!(!ok);
    assert_eq!(v["kind"], "run");
    assert_eq!(v["error"]["code"], "EMPTY_TASK");
    assert_eq!(v["error"]["retryable"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_config_key_is_a_validation_error() {
    let (ok, v) = run(
        "http://127.0.0.1:9".to_string(),
        vec!["hi", "--set", "browser.headless=false"],
    )
    .await;
    assert!(!ok);
    assert_eq!(v["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_run_returns_content_usage_and_metadata() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Paris"}}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
            }))
        }),
    );
    let addr = serve(app).await;
    let (ok, v) = run(
        format!("http://{addr}"),
        vec![
            "Capital of France?",
            "--set",
            "temperature=0.1",
            "--context",
            "tenant=acme",
            "--correlation-id",
            "req-1",
        ],
    )
    .await;
    assert!(ok, "{v}");
    let r = &v["result"];
    assert_eq!(r["status"], "success");
    assert_eq!(r["content"], "Paris");
    assert_eq!(r["usage"]["total_tokens"].as_u64(), Some(10));
    assert_eq!(r["metadata"]["model"], "stub-model");
    assert_eq!(r["metadata"]["tenant"], "acme");
    assert_eq!(r["metadata"]["correlation_id"], "req-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_auth_failure_keeps_its_code() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "no") }),
    );
    let addr = serve(app).await;
    let (ok, v) = run(format!("http://{addr}"), vec!["hello"]).await;
    assert!(!ok);
    assert_eq!(v["error"]["code"], "AUTH_ERROR");
}
