//! End-to-end test: drive a real in-process gateway over HTTP with the
//! control client.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use sp_ctl::archive;
use sp_ctl::client::RpcClient;
use sp_gateway::api;
use sp_gateway::platform::{Registry, Workspace};
use sp_gateway::queues::{BackendKind, Manager, PlatformDelivery};
use sp_gateway::state::AppState;
use sp_gateway::templates::TemplateStore;
use sp_gateway::{policy, stats};

const ADMIN_PASSWORD: &str = "integration";

async fn spawn_gateway(dir: &std::path::Path) -> String {
    let cancel = CancellationToken::new();
    let registry = Arc::new(Registry::open(dir.join("project.json"), "").unwrap());
    let policies = Arc::new(policy::Engine::open(dir.join("policies.json")).unwrap());
    let stats = Arc::new(stats::Recorder::open(dir.join(".stats"), 128).unwrap());
    let queues = Arc::new(
        Manager::open(
            dir.join("queues.json"),
            BackendKind::Memory(16),
            Arc::new(PlatformDelivery {
                registry: registry.clone(),
                policies: policies.clone(),
                stats: stats.clone(),
            }),
            Some(policies.clone()),
            cancel.clone(),
        )
        .unwrap(),
    );
    let templates = Arc::new(TemplateStore::new(dir.join(".templates")));
    let workspace = Arc::new(Workspace::new(
        dir,
        registry.clone(),
        policies.clone(),
        templates,
        None,
    ));
    let auth = Arc::new(
        api::auth::AdminAuth::open(dir.join("server.json"), ADMIN_PASSWORD).unwrap(),
    );
    let state = AppState {
        registry,
        policies,
        queues,
        stats,
        auth,
        workspace,
        cancel,
        behind_proxy: false,
        dev: true,
    };
    let app = api::router(&state).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn create_upload_download_round_trip() {
    let server_dir = tempfile::tempdir().unwrap();
    let base_url = spawn_gateway(server_dir.path()).await;
    let client = RpcClient::new(&base_url);

    let token = client.login("admin", ADMIN_PASSWORD).await.unwrap();

    // create a lambda remotely
    let info = client.call("ProjectAPI.Create", json!([token])).await.unwrap();
    let uid = info["uid"].as_str().unwrap().to_string();

    // build a local working copy and upload it
    let work = tempfile::tempdir().unwrap();
    std::fs::write(work.path().join("manifest.json"), r#"{"run":["/bin/cat","-"],"output_headers":{},"public":true}"#).unwrap();
    std::fs::write(work.path().join("app.txt"), "local content").unwrap();
    let tarball = archive::pack(work.path()).unwrap();
    client
        .call(
            "LambdaAPI.Upload",
            json!([token, uid, BASE64.encode(&tarball)]),
        )
        .await
        .unwrap();

    // the uploaded file is visible through the files API
    let files = client
        .call("LambdaAPI.Files", json!([token, uid, ""]))
        .await
        .unwrap();
    let names: Vec<&str> = files
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|f| f["name"].as_str())
        .collect();
    assert!(names.contains(&"app.txt"), "{names:?}");

    // download and unpack: same tree comes back
    let reply = client
        .call("LambdaAPI.Download", json!([token, uid]))
        .await
        .unwrap();
    let tarball = BASE64.decode(reply.as_str().unwrap()).unwrap();
    let restored = tempfile::tempdir().unwrap();
    archive::unpack(&tarball, restored.path()).unwrap();
    assert_eq!(
        std::fs::read_to_string(restored.path().join("app.txt")).unwrap(),
        "local content"
    );

    // the uploaded manifest is live: the lambda echoes over HTTP
    let response = reqwest::Client::new()
        .post(format!("{base_url}a/{uid}"))
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ping");
}

#[tokio::test]
async fn alias_management_round_trip() {
    let server_dir = tempfile::tempdir().unwrap();
    let base_url = spawn_gateway(server_dir.path()).await;
    let client = RpcClient::new(&base_url);
    let token = client.login("admin", ADMIN_PASSWORD).await.unwrap();

    let info = client.call("ProjectAPI.Create", json!([token])).await.unwrap();
    let uid = info["uid"].as_str().unwrap();

    client
        .call("LambdaAPI.Link", json!([token, uid, "greet"]))
        .await
        .unwrap();
    let info = client.call("LambdaAPI.Info", json!([token, uid])).await.unwrap();
    assert!(info["aliases"].as_array().unwrap().iter().any(|a| a == "greet"));

    client
        .call("LambdaAPI.Unlink", json!([token, "greet"]))
        .await
        .unwrap();
    let info = client.call("LambdaAPI.Info", json!([token, uid])).await.unwrap();
    assert!(info["aliases"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn bad_login_is_rejected() {
    let server_dir = tempfile::tempdir().unwrap();
    let base_url = spawn_gateway(server_dir.path()).await;
    let client = RpcClient::new(&base_url);
    assert!(client.login("admin", "wrong").await.is_err());
}
