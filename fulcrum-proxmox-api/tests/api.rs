//! Wire-level tests for the Proxmox VE client against a mock HTTP server.

use fulcrum_proxmox_api::{Error, ProxmoxVeApi, VmState};
use httpmock::prelude::*;

const TOKEN: &str = "agent@pve!kube=00000000-0000-0000-0000-000000000000";
const UPID: &str = "UPID:pve:0003C4D8:02A5B9C1:65D4E8F2:qmclone:9354:agent@pve:";

fn client(server: &MockServer) -> ProxmoxVeApi {
    ProxmoxVeApi::new(server.base_url(), TOKEN, "pve", "local-lvm", false).unwrap()
}

#[tokio::test]
async fn clone_vm_posts_form_and_parses_upid() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api2/json/nodes/pve/qemu/100/clone")
                .header("authorization", format!("PVEAPIToken={TOKEN}"))
                .body_contains("newid=9354")
                .body_contains("name=tc-node-n1")
                .body_contains("full=1")
                .body_contains("storage=local-lvm");
            then.status(200)
                .json_body(serde_json::json!({ "data": UPID }));
        })
        .await;

    let api = client(&server);
    let task = api.clone_vm(100, 9354, "tc-node-n1").await.unwrap();

    assert_eq!(task.upid(), UPID);
    assert_eq!(task.node(), "pve");
    assert_eq!(task.parsed().task_type, "qmclone");
    mock.assert_async().await;
}

#[tokio::test]
async fn clone_vm_maps_existing_id_to_conflict() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api2/json/nodes/pve/qemu/100/clone");
            then.status(500)
                .body("unable to create VM 9354: VM 9354 already exists on node 'pve'");
        })
        .await;

    let api = client(&server);
    let err = api.clone_vm(100, 9354, "tc-node-n1").await.unwrap_err();
    assert!(matches!(err, Error::VmIdInUse(9354)));
}

#[tokio::test]
async fn configure_vm_sends_shape_and_cicustom() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api2/json/nodes/pve/qemu/9354/config")
                .body_contains("cores=2")
                .body_contains("memory=2048");
            then.status(200)
                .json_body(serde_json::json!({ "data": UPID }));
        })
        .await;

    let api = client(&server);
    api.configure_vm(9354, 2, 2048, "user=local:snippets/node.yml")
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn vm_info_maps_status_payload() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api2/json/nodes/pve/qemu/9354/status/current");
            then.status(200).json_body(serde_json::json!({
                "data": {
                    "status": "running",
                    "name": "tc-node-n1",
                    "cpu": 0.25,
                    "cpus": 2,
                    "mem": 1073741824u64,
                    "maxmem": 2147483648u64,
                    "disk": 0,
                    "uptime": 3600,
                }
            }));
        })
        .await;

    let api = client(&server);
    let info = api.vm_info(9354).await.unwrap();
    assert_eq!(info.state, VmState::Running);
    assert_eq!(info.cores, 2);
    assert_eq!(info.cpu, 0.25);
    assert_eq!(info.maxmem, 2_147_483_648);
    assert_eq!(info.uptime, 3600);
}

#[tokio::test]
async fn wait_for_task_returns_on_ok_exit() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/tasks/");
            then.status(200).json_body(serde_json::json!({
                "data": { "status": "stopped", "exitstatus": "OK" }
            }));
        })
        .await;

    let api = client(&server);
    let task = fulcrum_proxmox_api::TaskHandle::parse(UPID).unwrap();
    let status = api
        .wait_for_task(&task, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert!(status.is_finished());
    assert!(status.is_ok());
}

#[tokio::test]
async fn wait_for_task_surfaces_task_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/tasks/");
            then.status(200).json_body(serde_json::json!({
                "data": { "status": "stopped", "exitstatus": "clone failed: no space left" }
            }));
        })
        .await;

    let api = client(&server);
    let task = fulcrum_proxmox_api::TaskHandle::parse(UPID).unwrap();
    let err = api
        .wait_for_task(&task, std::time::Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TaskFailed(_)));
}

#[tokio::test]
async fn task_status_is_addressed_on_the_upid_node() {
    // The task's node differs from the client's configured node.
    let other = "UPID:pve2:0003C4D8:02A5B9C1:65D4E8F2:qmstart:9354:agent@pve:";

    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/nodes/pve2/tasks/");
            then.status(200).json_body(serde_json::json!({
                "data": { "status": "running" }
            }));
        })
        .await;

    let api = client(&server);
    let task = fulcrum_proxmox_api::TaskHandle::parse(other).unwrap();
    let status = api.task_status(&task).await.unwrap();
    assert!(!status.is_finished());
    mock.assert_async().await;
}

#[tokio::test]
async fn start_and_stop_post_to_status_endpoints() {
    let server = MockServer::start_async().await;
    let start = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api2/json/nodes/pve/qemu/9354/status/start");
            then.status(200)
                .json_body(serde_json::json!({ "data": UPID }));
        })
        .await;
    let stop = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api2/json/nodes/pve/qemu/9354/status/stop");
            then.status(200)
                .json_body(serde_json::json!({ "data": UPID }));
        })
        .await;

    let api = client(&server);
    api.start_vm(9354).await.unwrap();
    api.stop_vm(9354).await.unwrap();
    start.assert_async().await;
    stop.assert_async().await;
}

#[tokio::test]
async fn http_errors_surface_the_status_code() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api2/json/nodes/pve/qemu/9354/status/start");
            then.status(403).body("permission denied");
        })
        .await;

    let api = client(&server);
    let err = api.start_vm(9354).await.unwrap_err();
    assert!(matches!(err, Error::Http(status) if status.as_u16() == 403));
}

#[tokio::test]
async fn delete_vm_uses_http_delete() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/api2/json/nodes/pve/qemu/9354");
            then.status(200)
                .json_body(serde_json::json!({ "data": UPID }));
        })
        .await;

    let api = client(&server);
    api.delete_vm(9354).await.unwrap();
    mock.assert_async().await;
}
