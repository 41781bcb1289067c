//! Gatan Ultrascan 895 driver against an in-process plugin server.
//!
//! The fake server answers like the DigitalMicrograph plugin: a version
//! string, `OK`, or `ERR`. ACQUIRE commands write a raw i32 frame to the
//! path named in the command.

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uedinst::instruments::gatan::SENSOR_SIZE;
use uedinst::instruments::{GatanConfig, GatanUltrascan895};
use uedinst::InstrumentError;

const VERSION: &str = "1.2";

/// Spawn a fake plugin server. Every received command is forwarded on the channel.
async fn spawn_plugin(answer_version: bool) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let command = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = tx.send(command.clone());

            let answer = match command.as_str() {
                "ULTRASCAN;VERSION" if !answer_version => break,
                "ULTRASCAN;VERSION" => VERSION.to_string(),
                "ULTRASCAN;INSERT;TRUE" | "ULTRASCAN;INSERT;FALSE" => "OK".to_string(),
                c if c.starts_with("ULTRASCAN;ACQUIRE;") => {
                    let args = &c["ULTRASCAN;ACQUIRE;".len()..];
                    match args.splitn(4, ',').nth(3) {
                        Some(path) => {
                            write_frame(PathBuf::from(path)).await;
                            "OK".to_string()
                        }
                        None => "ERR".to_string(),
                    }
                }
                _ => "ERR".to_string(),
            };
            if socket.write_all(answer.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (port, rx)
}

/// Frame of 100 counts, with one pixel above and one below the i16 range.
async fn write_frame(path: PathBuf) {
    let mut frame = vec![100i32; SENSOR_SIZE * SENSOR_SIZE];
    frame[0] = 70_000;
    frame[1] = -70_000;
    frame[SENSOR_SIZE + 2] = 1234;
    let bytes: Vec<u8> = frame.iter().flat_map(|p| p.to_le_bytes()).collect();
    tokio::fs::write(path, bytes).await.unwrap();
}

fn config(port: u16, tempdir: Option<PathBuf>) -> GatanConfig {
    GatanConfig {
        port,
        tempdir,
        timeout_ms: 2000,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_reads_version() {
    let (port, mut commands) = spawn_plugin(true).await;
    let camera = GatanUltrascan895::connect(&config(port, None)).await.unwrap();

    assert_eq!(camera.version(), VERSION);
    assert_eq!(commands.recv().await.unwrap(), "ULTRASCAN;VERSION");
    camera.close().await.unwrap();
}

#[tokio::test]
async fn test_insert_and_retract() {
    let (port, mut commands) = spawn_plugin(true).await;
    let mut camera = GatanUltrascan895::connect(&config(port, None)).await.unwrap();
    commands.recv().await.unwrap();

    camera.insert(true).await.unwrap();
    assert_eq!(commands.recv().await.unwrap(), "ULTRASCAN;INSERT;TRUE");
    camera.insert(false).await.unwrap();
    assert_eq!(commands.recv().await.unwrap(), "ULTRASCAN;INSERT;FALSE");
}

#[tokio::test]
async fn test_err_answer_becomes_command_error() {
    let (port, _commands) = spawn_plugin(true).await;
    let mut camera = GatanUltrascan895::connect(&config(port, None)).await.unwrap();

    let err = camera
        .send_command(&["ULTRASCAN;", "BOGUS"], None)
        .await
        .unwrap_err();
    match err {
        InstrumentError::Command { command, answer } => {
            assert_eq!(command, "ULTRASCAN;BOGUS");
            assert_eq!(answer, "ERR");
        }
        other => panic!("expected Command error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_acquire_image_reads_and_clips_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (port, mut commands) = spawn_plugin(true).await;
    let mut camera = GatanUltrascan895::connect(&config(port, Some(dir.path().to_path_buf())))
        .await
        .unwrap();
    commands.recv().await.unwrap();

    let image = camera.acquire_image(0.0, true, false).await.unwrap();

    let expected = format!(
        "ULTRASCAN;ACQUIRE;0.000,True,False,{}",
        dir.path().join("_uedinst_temp.dat").display()
    );
    assert_eq!(commands.recv().await.unwrap(), expected);

    assert_eq!(image.width, SENSOR_SIZE);
    assert_eq!(image.height, SENSOR_SIZE);
    assert_eq!(image.get(0, 0), Some(i16::MAX));
    assert_eq!(image.get(0, 1), Some(i16::MIN));
    assert_eq!(image.get(1, 2), Some(1234));
    assert_eq!(image.get(SENSOR_SIZE - 1, SENSOR_SIZE - 1), Some(100));
}

#[tokio::test]
async fn test_negative_exposure_rejected_before_sending() {
    let (port, mut commands) = spawn_plugin(true).await;
    let mut camera = GatanUltrascan895::connect(&config(port, None)).await.unwrap();
    commands.recv().await.unwrap();

    let err = camera.acquire_image(-1.0, true, true).await.unwrap_err();
    assert!(matches!(err, InstrumentError::InvalidParameter(_)));

    let nothing = tokio::time::timeout(Duration::from_millis(50), commands.recv()).await;
    assert!(nothing.is_err(), "no command should reach the server");
}

#[tokio::test]
async fn test_exposure_beyond_duration_range_rejected() {
    let (port, mut commands) = spawn_plugin(true).await;
    let mut camera = GatanUltrascan895::connect(&config(port, None)).await.unwrap();
    commands.recv().await.unwrap();

    for exposure in [1e20, f64::INFINITY, f64::NAN] {
        let err = camera.acquire_image(exposure, true, true).await.unwrap_err();
        assert!(matches!(err, InstrumentError::InvalidParameter(_)));
    }

    let nothing = tokio::time::timeout(Duration::from_millis(50), commands.recv()).await;
    assert!(nothing.is_err(), "no command should reach the server");
}

#[tokio::test]
async fn test_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = GatanUltrascan895::connect(&config(port, None))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, InstrumentError::Connection(_)));
    assert!(err.to_string().contains("Make sure it is open"));
}

#[tokio::test]
async fn test_plugin_without_version_command() {
    let (port, _commands) = spawn_plugin(false).await;

    let err = GatanUltrascan895::connect(&config(port, None))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, InstrumentError::Connection(_)));
    assert!(err.to_string().contains("too old"));
}

#[tokio::test]
async fn test_hostname_rejected() {
    let config = GatanConfig {
        addr: "dm-host".into(),
        ..Default::default()
    };
    let err = GatanUltrascan895::connect(&config).await.err().unwrap();
    assert!(matches!(err, InstrumentError::InvalidAddress(_)));
}
