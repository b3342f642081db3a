//! Static artifact surface: allow-list and traversal behavior.

mod common;

use std::sync::Arc;

use common::{FnRunnerFactory, harness, spawn_fake_receiver, test_config};
use xg2g::runner::StubRunner;

async fn app_with_artifacts() -> (axum_test::TestServer, tempfile::TempDir, tempfile::TempDir) {
    let (addr, _receiver) = spawn_fake_receiver().await;
    let data = tempfile::tempdir().unwrap();
    let hls = tempfile::tempdir().unwrap();
    let h = harness(
        test_config(addr, data.path(), hls.path()),
        Arc::new(FnRunnerFactory::new(StubRunner::healthy)),
    )
    .await;
    tokio::fs::write(
        data.path().join("playlist.m3u"),
        "#EXTM3U\n#EXTINF:-1,Das Erste HD\nhttp://receiver:8001/1:0:19\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        data.path().join("xmltv.xml"),
        "<?xml version=\"1.0\"?><tv/>\n",
    )
    .await
    .unwrap();
    (h.app(), data, hls)
}

#[tokio::test]
async fn allowed_artifacts_are_served_with_content_types() {
    let (app, _data, _hls) = app_with_artifacts().await;

    let playlist = app.get("/files/playlist.m3u").await;
    playlist.assert_status_ok();
    assert_eq!(playlist.header("content-type"), "audio/x-mpegurl");
    assert!(playlist.text().starts_with("#EXTM3U"));

    let guide = app.get("/files/xmltv.xml").await;
    guide.assert_status_ok();
    assert_eq!(guide.header("content-type"), "application/xml");

    // allow-listed but not rendered yet
    let missing = app.get("/files/epg.xml").await;
    missing.assert_status_not_found();
}

#[tokio::test]
async fn traversal_attempts_are_403() {
    let (app, _data, _hls) = app_with_artifacts().await;

    let plain = app.get("/files/../etc/passwd").await;
    plain.assert_status_forbidden();

    let encoded = app
        .get("/files/playlist.m3u%2F..%2F..%2Fetc%2Fpasswd")
        .await;
    encoded.assert_status_forbidden();

    let double_encoded = app.get("/files/%252e%252e%252fetc%252fpasswd").await;
    double_encoded.assert_status_forbidden();
}

#[tokio::test]
async fn names_outside_the_allowlist_are_rejected() {
    let (app, data, _hls) = app_with_artifacts().await;

    // even a file that exists in the data dir is refused by name
    tokio::fs::write(data.path().join("xg2g.sqlite"), b"sqlite")
        .await
        .unwrap();

    for name in ["xg2g.sqlite", "playlist.m3u8", "epg.json", "config.yaml"] {
        let response = app.get(&format!("/files/{name}")).await;
        assert!(
            response.status_code().as_u16() >= 400,
            "{name} must be rejected"
        );
    }

    let forbidden = app.get("/files/xg2g.sqlite").await;
    let body: serde_json::Value = forbidden.json();
    assert_eq!(body["code"], "FILE_NOT_ALLOWED");
}
