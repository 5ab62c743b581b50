use axum::{http::StatusCode, response::Html, routing::get, Router};
use std::net::SocketAddr;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn run_fetch(url: String, extra: &'static [&'static str]) -> (bool, serde_json::Value) {
    tokio::task::spawn_blocking(move || {
        let bin = assert_cmd::cargo::cargo_bin!("agentpipe");
        let out = std::process::Command::new(bin)
            .arg("fetch")
            .arg(&url)
            .args(["--retry-delay-ms", "1"])
            .args(extra)
            .env("AGENTPIPE_BROWSER_DRIVER", "http")
            .env_remove("AGENTPIPE_ENV_FILE")
            .output()
            .expect("run agentpipe fetch");
        let s = String::from_utf8_lossy(&out.stdout);
        let v: serde_json::Value = serde_json::from_str(s.trim()).expect("parse fetch json");
        (out.status.success(), v)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_returns_page_text_in_the_envelope() {
    let app = Router::new().route(
        "/doc",
        get(|| async {
            Html("<html><head><title>Doc</title></head><body><p>Hello from the fixture.</p></body></html>")
        }),
    );
    let addr = serve(app).await;

    let (ok, v) = run_fetch(format!("http://{addr}/doc"), &[]).await;
    assert!(ok, "{v}");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"], "fetch");
    assert_eq!(v["ok"], true);
    assert_eq!(v["result"]["status"], "success");
    assert_eq!(v["result"]["title"], "Doc");
    assert_eq!(v["result"]["attempts"].as_u64(), Some(1));
    assert!(v["result"]["content"]
        .as_str()
        .unwrap_or("")
        .contains("Hello from the fixture."));
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_404_fails_after_one_attempt() {
    let app = Router::new().route("/gone", get(|| async { (StatusCode::NOT_FOUND, "nope") }));
    let addr = serve(app).await;

    let (ok, v) = run_fetch(format!("http://{addr}/gone"), &["--retry-count", "3"]).await;
    assert!(!ok);
    assert_eq!(v["ok"], false);
    assert_eq!(v["error"]["code"], "FETCH_ERROR");
    assert_eq!(v["error"]["retryable"], false);
    assert_eq!(v["attempts"].as_u64(), Some(1));
    assert!(v["error"]["message"].as_str().unwrap_or("").contains("404"));
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_server_errors_stay_retryable_after_exhaustion() {
    let app = Router::new().route(
        "/down",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
    );
    let addr = serve(app).await;

    let (ok, v) = run_fetch(format!("http://{addr}/down"), &["--retry-count", "1"]).await;
    assert!(!ok);
    assert_eq!(v["error"]["code"], "FETCH_ERROR");
    assert_eq!(v["error"]["retryable"], true);
    assert_eq!(v["attempts"].as_u64(), Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_rejects_non_http_urls_without_a_browser() {
    let (ok, v) = run_fetch("ftp://example.com/file".to_string(), &[]).await;
    assert!(!ok);
    assert_eq!(v["error"]["code"], "FETCH_ERROR");
    assert_eq!(v["error"]["retryable"], false);
    assert_eq!(v["attempts"].as_u64(), Some(1));
}
