use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use vista_sentinel::api::{ApiConfig, ApiHandle, ApiServer};
use vista_sentinel::detect::ScoredBox;
use vista_sentinel::{
    AlertController, BoundingBox, CaptureSettings, DeviceSourceProvider, FrameHub,
    InMemoryEventLog, ModelKind, ModelRegistry, PipelineController, PipelineParts, SilentSound,
    StubBackend,
};

fn controller(url: &str) -> Arc<PipelineController> {
    let mut registry = ModelRegistry::new();
    registry.register(
        ModelKind::Fire,
        StubBackend::always(vec![ScoredBox::new(
            "fire",
            0.8,
            BoundingBox::new(2.0, 2.0, 12.0, 12.0),
        )]),
    );
    Arc::new(PipelineController::new(PipelineParts {
        provider: Arc::new(DeviceSourceProvider),
        settings: CaptureSettings {
            url: url.to_string(),
            width: 32,
            height: 24,
            target_fps: 50,
            buffer_frames: 1,
        },
        registry,
        logger: Arc::new(Mutex::new(InMemoryEventLog::new())),
        alert: Arc::new(AlertController::with_system_clock(
            Duration::from_secs(600),
            Arc::new(SilentSound),
        )),
        hub: Arc::new(FrameHub::new()),
        channel_capacity: 10,
        threshold: 0.40,
        jpeg_quality: 70,
    }))
}

fn spawn(controller: Arc<PipelineController>) -> Result<ApiHandle> {
    ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            default_subject: "operator".to_string(),
            ..ApiConfig::default()
        },
        controller,
    )
    .spawn()
}

fn call(method: &str, url: &str, subject: Option<&str>) -> (u16, Value) {
    let mut request = ureq::request(method, url).timeout(Duration::from_secs(5));
    if let Some(subject) = subject {
        request = request.set("X-Subject", subject);
    }
    let response = match request.call() {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => panic!("request to {url} failed: {err}"),
    };
    let status = response.status();
    let raw = response.into_string().expect("response body");
    let body: Value = serde_json::from_str(&raw).expect("json body");
    (status, body)
}

#[test]
fn control_routes_drive_the_pipeline() -> Result<()> {
    let controller = controller("stub://api");
    let handle = spawn(controller.clone())?;
    let base = format!("http://{}", handle.addr);

    let (status, body) = call("GET", &format!("{base}/alert_status"), None);
    assert_eq!(status, 200);
    assert_eq!(body["is_alert_active"], false);
    assert_eq!(body["anomaly"], "None");

    let (status, body) = call("POST", &format!("{base}/start"), Some("alice"));
    assert_eq!(status, 200);
    assert_eq!(body["status"], "started");
    let (_, body) = call("POST", &format!("{base}/start"), Some("bob"));
    assert_eq!(body["status"], "already_running");
    assert_eq!(body["subject"], "alice");

    let mut active = false;
    for _ in 0..100 {
        let (_, body) = call("GET", &format!("{base}/alert_status"), None);
        if body["is_alert_active"] == true {
            assert_eq!(body["anomaly"], "fire");
            active = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(active, "alert never became active");

    let (status, body) = call("POST", &format!("{base}/acknowledge_alert"), None);
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Alert acknowledged and sound stopped.");
    let (_, body) = call("GET", &format!("{base}/alert_status"), None);
    assert_eq!(body["is_alert_active"], false);

    let (status, body) = call("GET", &format!("{base}/events/recent?limit=3"), None);
    assert_eq!(status, 200);
    assert_eq!(body["subject"], "alice");
    let events = body["events"].as_array().expect("events array");
    assert!(!events.is_empty() && events.len() <= 3);
    assert_eq!(events[0]["category"], "fire");

    let (status, _) = call("GET", &format!("{base}/events/recent?limit=zero"), None);
    assert_eq!(status, 400);

    let (_, body) = call("POST", &format!("{base}/stop"), None);
    assert_eq!(body["status"], "stopped");
    let (_, body) = call("POST", &format!("{base}/stop"), None);
    assert_eq!(body["status"], "not_running");
    let (_, body) = call("GET", &format!("{base}/health"), None);
    assert_eq!(body["running"], false);

    handle.stop()?;
    Ok(())
}

#[test]
fn unavailable_source_is_reported_and_routes_are_checked() -> Result<()> {
    let handle = spawn(controller("stub://api?fail=1"))?;
    let base = format!("http://{}", handle.addr);

    let (status, body) = call("POST", &format!("{base}/start"), None);
    assert_eq!(status, 503);
    assert_eq!(body["error"], "source_unavailable");

    let (status, _) = call("GET", &format!("{base}/start"), None);
    assert_eq!(status, 405);
    let (status, _) = call("GET", &format!("{base}/nope"), None);
    assert_eq!(status, 404);

    handle.stop()?;
    Ok(())
}

#[test]
fn video_feed_streams_multipart_jpeg_parts() -> Result<()> {
    let controller = controller("stub://feed");
    let handle = spawn(controller.clone())?;
    controller.start("alice")?;

    let mut stream = TcpStream::connect(handle.addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8";
    while received.windows(marker.len()).filter(|w| *w == &marker[..]).count() < 2 {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));

    controller.stop();
    // Stopping the pipeline ends the stream.
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) => panic!("stream did not close: {err}"),
        }
    }

    handle.stop()?;
    Ok(())
}
