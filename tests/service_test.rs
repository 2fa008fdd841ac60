mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{FakeDevice, RebootBehavior, Response};
use dut_provision::config::{Config, DutConfig};
use dut_provision::crash::{encode_frame, CrashBlob, CrashInfo, CrashPayload, FetchCrashesResponse};
use dut_provision::error::{Error, ErrorKind};
use dut_provision::lro::OperationResponse;
use dut_provision::remote::{CacheDestination, CacheSource, StderrMode};
use dut_provision::service::DutService;

const SERIALIZER: &str = "/usr/local/sbin/crash_serializer";
const WAIT: Duration = Duration::from_secs(10);

fn service(device: &FakeDevice) -> DutService {
    let mut config = Config::new(DutConfig::new("dut1".to_string()));
    config.cache_address = common::CACHE.to_string();
    config.serializer_path = SERIALIZER.to_string();
    config.proto_chunk_size = 4096;
    config.reboot_timeout_secs = 5;
    DutService::new(Arc::new(device.adapter()), &config)
}

fn crash(id: i64, exec_name: &str) -> FetchCrashesResponse {
    FetchCrashesResponse {
        crash_id: id,
        payload: Some(CrashPayload::Crash(CrashInfo {
            exec_name: exec_name.to_string(),
            prog: exec_name.to_string(),
            sig: "SIGSEGV".to_string(),
            ..Default::default()
        })),
    }
}

fn blob(id: i64, data: &[u8]) -> FetchCrashesResponse {
    FetchCrashesResponse {
        crash_id: id,
        payload: Some(CrashPayload::Blob(CrashBlob {
            key: "log".to_string(),
            blob: data.to_vec(),
            filename: "chrome.20240101.log".to_string(),
        })),
    }
}

#[tokio::test]
async fn test_exec_command_reports_raw_outcome() {
    let device = FakeDevice::new();
    device.on(
        "cat /nope",
        Response::fail(1, "cat: /nope: No such file or directory"),
    );
    let service = service(&device);

    let result = service
        .exec_command("cat", &["/nope"], None, StderrMode::Separate)
        .await;
    assert!(result.started);
    assert!(result.signaled);
    assert_eq!(result.exit_status, 1);
    assert_eq!(result.stderr_lossy(), "cat: /nope: No such file or directory");
    assert_eq!(device.commands(), vec!["cat /nope"]);
}

#[tokio::test]
async fn test_restart_operation_completes() {
    let device = FakeDevice::new();
    device.set_reboot(RebootBehavior::CloseAfter(Duration::from_millis(20)));
    let service = service(&device);

    let op = service.restart(vec!["-f".to_string()]).unwrap();
    assert!(!op.done);

    let op = service.wait_operation(&op.name, WAIT).await.unwrap();
    assert!(op.done);
    assert_eq!(
        op.result,
        Some(Ok(OperationResponse::Restart {
            output: String::new()
        }))
    );
    assert!(device.commands().contains(&"reboot -f".to_string()));
    assert_eq!(device.dials(), 2);
}

#[tokio::test]
async fn test_restart_failure_is_recorded_on_operation() {
    let device = FakeDevice::new();
    device.on("reboot", Response::fail(1, "reboot: Operation not permitted"));
    let service = service(&device);

    let op = service.restart(Vec::new()).unwrap();
    let op = service.wait_operation(&op.name, WAIT).await.unwrap();
    let err = op.result.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Command);
    assert!(err.message.contains("Operation not permitted"));
}

#[tokio::test]
async fn test_cache_operation_downloads_to_file() {
    let device = FakeDevice::new();
    let service = service(&device);

    let op = service
        .cache(
            CacheSource::GsFile("gs://bucket/images/obj.bin".to_string()),
            CacheDestination::File("/tmp/obj.bin".to_string()),
        )
        .unwrap();
    let op = service.wait_operation(&op.name, WAIT).await.unwrap();
    assert_eq!(op.result, Some(Ok(OperationResponse::Cache)));
    assert_eq!(
        device.commands(),
        vec!["curl -S -s -v -# -C - --retry 3 --retry-delay 60 -o /tmp/obj.bin http://cache:8082/download/bucket/images/obj.bin"]
    );
}

#[tokio::test]
async fn test_cache_rejects_bad_source_before_registering() {
    let device = FakeDevice::new();
    let service = service(&device);

    let err = service
        .cache(
            CacheSource::GsZipFile("s3://bucket/obj.zip".to_string()),
            CacheDestination::Pipe("tar -x".to_string()),
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSource(_)));
    assert_eq!(device.dials(), 0);
}

#[tokio::test]
async fn test_force_reconnect_operation() {
    let device = FakeDevice::new();
    let service = service(&device);
    service.adapter().run_cmd("true", &[]).await.unwrap();

    let op = service.force_reconnect().unwrap();
    let op = service.wait_operation(&op.name, WAIT).await.unwrap();
    assert_eq!(op.result, Some(Ok(OperationResponse::ForceReconnect)));
    assert_eq!(device.dials(), 2);
}

#[tokio::test]
async fn test_fetch_crashes_delivers_frames_in_order() {
    let device = FakeDevice::new();
    device.add_file(SERIALIZER);

    let mut stream = Vec::new();
    stream.extend(encode_frame(&crash(1, "chrome")));
    stream.extend(encode_frame(&blob(1, b"line one\n")));
    stream.extend(encode_frame(&crash(2, "powerd")));
    device.on(
        "crash_serializer --chunk_size=4096",
        Response {
            stdout: stream,
            stderr: b"collected 2 crashes\n".to_vec(),
            status: 0,
        },
    );
    let service = service(&device);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let count = service
        .fetch_crashes(false, move |message| {
            sink.lock().unwrap().push(message);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(count, 3);
    let received = received.lock().unwrap();
    assert_eq!(*received, vec![crash(1, "chrome"), blob(1, b"line one\n"), crash(2, "powerd")]);
    assert_eq!(device.count("--fetch_coredumps"), 0);
}

#[tokio::test]
async fn test_fetch_crashes_requests_core_dumps() {
    let device = FakeDevice::new();
    device.add_file(SERIALIZER);
    let service = service(&device);

    let count = service.fetch_crashes(true, |_| Ok(())).await.unwrap();
    assert_eq!(count, 0);
    assert!(device.commands().contains(
        &"/usr/local/sbin/crash_serializer --chunk_size=4096 --fetch_coredumps".to_string()
    ));
}

#[tokio::test]
async fn test_fetch_crashes_without_serializer() {
    let device = FakeDevice::new();
    let service = service(&device);

    let err = service.fetch_crashes(false, |_| Ok(())).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(device.count("--chunk_size"), 0);
}

#[tokio::test]
async fn test_detect_device_config_id() {
    let device = FakeDevice::new();
    device.on(
        "crosid",
        Response::ok("SKU='131072'\nPLATFORM_NAME='Octopus'\nMODEL='bobba'\nBRAND_CODE='ZZCR'\n"),
    );
    let service = service(&device);

    let id = service.detect_device_config_id().await.unwrap();
    assert_eq!(id.model, "bobba");
    assert_eq!(id.platform, "Octopus");
    assert_eq!(id.sku, Some(131072));
    assert_eq!(id.brand, "ZZCR");
}

#[tokio::test]
async fn test_close_releases_operations() {
    let device = FakeDevice::new();
    let service = service(&device);

    let op = service.force_reconnect().unwrap();
    service.wait_operation(&op.name, WAIT).await.unwrap();
    service.close();

    assert!(matches!(
        service.get_operation(&op.name),
        Err(Error::NotFound(_))
    ));
    assert!(service.restart(Vec::new()).is_err());
    assert!(service.adapter().current_connection().is_none());
}

#[tokio::test]
async fn test_close_stops_pending_restart() {
    let device = FakeDevice::new();
    device.set_reboot(RebootBehavior::Hang);
    let service = service(&device);

    let op = service.restart(Vec::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.commands().contains(&"reboot".to_string()));
    service.close();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(service.adapter().current_connection().is_none());
    assert_eq!(device.dials(), 1);
    assert!(matches!(
        service.get_operation(&op.name),
        Err(Error::NotFound(_))
    ));
}
