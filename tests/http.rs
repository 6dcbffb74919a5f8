mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::{Script, chunks, spawn_upstream, spawn_upstream_with_search};
use relayd::config::RelayConfig;
use relayd::relay::Relay;
use relayd::server::{AppState, router};

async fn serve(config: RelayConfig) -> SocketAddr {
    let relay = Relay::new(config).unwrap();
    let app = router(AppState::new(relay));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn root_streams_audio_until_upstream_ends() {
    let upstream = spawn_upstream(Script::Finite {
        chunks: chunks(&["ID3", "frame-1", "frame-2"]),
        gap: Duration::from_millis(20),
    })
    .await;
    let addr = serve(upstream.relay_config()).await;

    let resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "audio/mpeg");
    assert_eq!(resp.headers()["cache-control"], "no-cache");

    let body = tokio::time::timeout(Duration::from_secs(5), resp.bytes())
        .await
        .expect("body finished")
        .unwrap();
    assert_eq!(&body[..], b"ID3frame-1frame-2");
}

#[tokio::test]
async fn root_fails_fast_when_upstream_is_missing() {
    let upstream = spawn_upstream(Script::Finite {
        chunks: Vec::new(),
        gap: Duration::ZERO,
    })
    .await;
    let addr = serve(RelayConfig {
        upstream_url: upstream.missing_url(),
        ..upstream.relay_config()
    })
    .await;

    let resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("unavailable"));

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["listeners"], 0);
    assert!(status["session"].is_null());
}

#[tokio::test]
async fn status_reports_the_running_session() {
    let upstream = spawn_upstream(Script::Endless {
        gap: Duration::from_millis(5),
    })
    .await;
    let addr = serve(upstream.relay_config()).await;

    let mut resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
        .await
        .expect("chunk in time")
        .unwrap();
    assert!(first.is_some());

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["listeners"], 1);
    assert_eq!(status["sessions_started"], 1);
    assert_eq!(status["backpressure"], "drop-oldest");
    assert!(status["session"]["bytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn search_returns_track_urls() {
    let page = r#"
        <div data-url="https://ncsmusic.s3.eu-west-1.amazonaws.com/tracks/000/001/759/invincible-sped-up-1727366457-RfLWTl9BNp.mp3"></div>
        <div data-url="https://elsewhere.example/tracks/000/001/759/nope.mp3"></div>
    "#;
    let upstream = spawn_upstream_with_search(
        Script::Finite {
            chunks: Vec::new(),
            gap: Duration::ZERO,
        },
        page.to_string(),
    )
    .await;
    let addr = serve(upstream.relay_config()).await;

    let body: serde_json::Value =
        reqwest::get(format!("http://{addr}/search?name=invincible&genre=&mood=happy"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(
        body["tracks"],
        serde_json::json!([
            "https://ncsmusic.s3.eu-west-1.amazonaws.com/tracks/000/001/759/invincible-sped-up-1727366457-RfLWTl9BNp.mp3"
        ])
    );
}

#[tokio::test]
async fn client_disconnect_releases_the_listener() {
    let upstream = spawn_upstream(Script::Endless {
        gap: Duration::from_millis(5),
    })
    .await;
    let addr = serve(upstream.relay_config()).await;

    let mut resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
        .await
        .expect("chunk in time")
        .unwrap();
    assert!(first.is_some());
    drop(resp);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let status = loop {
        let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["listeners"] == 0 && status["session"].is_null() {
            break status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "listener still attached: {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(status["sessions_started"], 1);
    assert!(upstream.bodies_close().await);
}
