//! Admin JSON-RPC 2.0 endpoint (`POST /u/`).
//!
//! Positional params; every method except `UserAPI.Login` takes the JWT as
//! its first parameter. Domain errors become JSON-RPC error objects whose
//! `code` is the HTTP status of the error.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use sp_domain::{Error, Manifest, PolicyDefinition, QueueDescriptor, Result};

use crate::platform::Definition;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

pub async fn handle(State(state): State<AppState>, Json(req): Json<RpcRequest>) -> Response {
    let id = req.id.clone();
    let reply = match dispatch(&state, &req).await {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(e) => {
            tracing::debug!(method = %req.method, error = %e, "rpc call failed");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": e.http_status(), "message": e.to_string() },
            })
        }
    };
    Json(reply).into_response()
}

fn param<T: DeserializeOwned>(params: &[Value], idx: usize) -> Result<T> {
    let value = params
        .get(idx)
        .ok_or_else(|| Error::BadRequest(format!("missing parameter #{idx}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| Error::BadRequest(format!("invalid parameter #{idx}: {e}")))
}

fn authorize(state: &AppState, params: &[Value]) -> Result<()> {
    let token: String = param(params, 0)?;
    state.auth.validate(&token)?;
    Ok(())
}

fn def_json(def: &Definition) -> Value {
    json!({
        "uid": def.uid,
        "aliases": def.aliases,
        "manifest": def.manifest,
    })
}

fn settings_json(state: &AppState) -> Value {
    let config = state.registry.config();
    json!({
        "user": config.user,
        "public_key": state.workspace.public_ssh_key().ok(),
        "environment": config.environment,
    })
}

async fn dispatch(state: &AppState, req: &RpcRequest) -> Result<Value> {
    let p = &req.params;
    match req.method.as_str() {
        // ── UserAPI ─────────────────────────────────────────────────
        "UserAPI.Login" => {
            let login: String = param(p, 0)?;
            let password: String = param(p, 1)?;
            let token = state.auth.login(&login, &password)?;
            Ok(Value::String(token))
        }
        "UserAPI.ChangePassword" => {
            authorize(state, p)?;
            let password: String = param(p, 1)?;
            state.auth.change_password(&password)?;
            Ok(Value::Bool(true))
        }

        // ── ProjectAPI ──────────────────────────────────────────────
        "ProjectAPI.Config" => {
            authorize(state, p)?;
            Ok(settings_json(state))
        }
        "ProjectAPI.SetUser" => {
            authorize(state, p)?;
            let user: String = param(p, 1)?;
            let mut config = state.registry.config();
            config.user = user;
            state.registry.set_config(config)?;
            Ok(settings_json(state))
        }
        "ProjectAPI.SetEnvironment" => {
            authorize(state, p)?;
            #[derive(Deserialize)]
            struct Env {
                #[serde(default)]
                environment: std::collections::BTreeMap<String, String>,
            }
            let env: Env = param(p, 1)?;
            let mut config = state.registry.config();
            config.environment = env.environment;
            state.registry.set_config(config)?;
            Ok(settings_json(state))
        }
        "ProjectAPI.List" => {
            authorize(state, p)?;
            let list: Vec<Value> = state.registry.list().iter().map(def_json).collect();
            Ok(Value::Array(list))
        }
        "ProjectAPI.Stats" => {
            authorize(state, p)?;
            let limit: usize = param(p, 1)?;
            Ok(serde_json::to_value(state.stats.last(limit))?)
        }
        "ProjectAPI.Create" => {
            authorize(state, p)?;
            Ok(def_json(&state.workspace.create()?))
        }
        "ProjectAPI.CreateFromTemplate" => {
            authorize(state, p)?;
            let name: String = param(p, 1)?;
            Ok(def_json(&state.workspace.create_from_template(&name)?))
        }
        "ProjectAPI.CreateFromGit" => {
            authorize(state, p)?;
            let repo: String = param(p, 1)?;
            let def = state
                .workspace
                .create_from_git(&state.cancel, &repo)
                .await?;
            Ok(def_json(&def))
        }
        "ProjectAPI.Templates" => {
            authorize(state, p)?;
            let list: Vec<Value> = state
                .workspace
                .templates()
                .list()?
                .into_iter()
                .filter(|(_, tpl)| tpl.is_available())
                .map(|(key, tpl)| {
                    json!({ "name": key, "description": tpl.description })
                })
                .collect();
            Ok(Value::Array(list))
        }
        "ProjectAPI.AllTemplates" => {
            authorize(state, p)?;
            let list: Vec<Value> = state
                .workspace
                .templates()
                .list()?
                .into_iter()
                .map(|(key, tpl)| {
                    json!({
                        "name": key,
                        "description": tpl.description,
                        "available": tpl.is_available(),
                    })
                })
                .collect();
            Ok(Value::Array(list))
        }

        // ── LambdaAPI ───────────────────────────────────────────────
        "LambdaAPI.Upload" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let data: String = param(p, 2)?;
            let raw = BASE64
                .decode(data.as_bytes())
                .map_err(|e| Error::BadRequest(format!("tarball is not base64: {e}")))?;
            let def = state.registry.find_by_uid(&uid)?;
            def.lambda.import_tarball(raw.as_slice())?;
            Ok(Value::Bool(true))
        }
        "LambdaAPI.Download" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let def = state.registry.find_by_uid(&uid)?;
            let mut out = Vec::new();
            def.lambda.export_tarball(&mut out)?;
            Ok(Value::String(BASE64.encode(out)))
        }
        "LambdaAPI.Push" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let file: String = param(p, 2)?;
            let content: String = param(p, 3)?;
            let raw = BASE64
                .decode(content.as_bytes())
                .map_err(|e| Error::BadRequest(format!("content is not base64: {e}")))?;
            let def = state.registry.find_by_uid(&uid)?;
            def.lambda.write_file(&file, &mut raw.as_slice())?;
            Ok(Value::Bool(true))
        }
        "LambdaAPI.Pull" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let file: String = param(p, 2)?;
            let def = state.registry.find_by_uid(&uid)?;
            let mut out = Vec::new();
            def.lambda.read_file(&file, &mut out)?;
            Ok(Value::String(BASE64.encode(out)))
        }
        "LambdaAPI.Remove" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            state.workspace.remove(&uid)?;
            Ok(Value::Bool(true))
        }
        "LambdaAPI.Files" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let dir: String = param(p, 2)?;
            let def = state.registry.find_by_uid(&uid)?;
            Ok(serde_json::to_value(def.lambda.list_files(&dir)?)?)
        }
        "LambdaAPI.Info" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            Ok(def_json(&state.registry.find_by_uid(&uid)?))
        }
        "LambdaAPI.Update" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let manifest: Manifest = param(p, 2)?;
            manifest.validate()?;
            let def = state.registry.find_by_uid(&uid)?;
            def.lambda.set_manifest(manifest)?;
            Ok(def_json(&state.registry.find_by_uid(&uid)?))
        }
        "LambdaAPI.CreateFile" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let path: String = param(p, 2)?;
            let dir: bool = param(p, 3)?;
            let def = state.registry.find_by_uid(&uid)?;
            if dir {
                def.lambda.ensure_dir(&path)?;
            } else {
                def.lambda.write_file(&path, &mut std::io::empty())?;
            }
            Ok(Value::Bool(true))
        }
        "LambdaAPI.RemoveFile" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let path: String = param(p, 2)?;
            let def = state.registry.find_by_uid(&uid)?;
            def.lambda.remove_file(&path)?;
            Ok(Value::Bool(true))
        }
        "LambdaAPI.RenameFile" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let old: String = param(p, 2)?;
            let new: String = param(p, 3)?;
            let def = state.registry.find_by_uid(&uid)?;
            def.lambda.rename_file(&old, &new)?;
            Ok(Value::Bool(true))
        }
        "LambdaAPI.Stats" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let limit: usize = param(p, 2)?;
            Ok(serde_json::to_value(state.stats.last_by_uid(&uid, limit))?)
        }
        "LambdaAPI.Actions" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let def = state.registry.find_by_uid(&uid)?;
            Ok(serde_json::to_value(def.lambda.actions()?)?)
        }
        "LambdaAPI.Invoke" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let action: String = param(p, 2)?;
            let def = state.registry.find_by_uid(&uid)?;
            let mut out = Vec::new();
            def.lambda
                .do_action(
                    &state.cancel,
                    &action,
                    std::time::Duration::ZERO,
                    &state.registry.global_env(),
                    &mut out,
                )
                .await?;
            Ok(Value::String(String::from_utf8_lossy(&out).into_owned()))
        }
        "LambdaAPI.Link" => {
            authorize(state, p)?;
            let uid: String = param(p, 1)?;
            let alias: String = param(p, 2)?;
            Ok(def_json(&state.workspace.link(&uid, &alias)?))
        }
        "LambdaAPI.Unlink" => {
            authorize(state, p)?;
            let alias: String = param(p, 1)?;
            match state.workspace.unlink(&alias)? {
                Some(def) => Ok(def_json(&def)),
                None => Ok(Value::Null),
            }
        }

        // ── QueuesAPI ───────────────────────────────────────────────
        "QueuesAPI.Create" => {
            authorize(state, p)?;
            let descriptor: QueueDescriptor = param(p, 1)?;
            // target must exist at creation time
            state.registry.find_by_uid(&descriptor.target)?;
            state.queues.add(descriptor.clone())?;
            Ok(serde_json::to_value(descriptor)?)
        }
        "QueuesAPI.Remove" => {
            authorize(state, p)?;
            let name: String = param(p, 1)?;
            state.queues.remove(&name).await?;
            Ok(Value::Bool(true))
        }
        "QueuesAPI.Linked" => {
            authorize(state, p)?;
            let lambda: String = param(p, 1)?;
            Ok(serde_json::to_value(state.queues.find(&lambda))?)
        }
        "QueuesAPI.List" => {
            authorize(state, p)?;
            Ok(serde_json::to_value(state.queues.list())?)
        }
        "QueuesAPI.Assign" => {
            authorize(state, p)?;
            let name: String = param(p, 1)?;
            let lambda: String = param(p, 2)?;
            state.registry.find_by_uid(&lambda)?;
            state.queues.assign(&name, &lambda).await?;
            Ok(Value::Bool(true))
        }

        // ── PoliciesAPI ─────────────────────────────────────────────
        "PoliciesAPI.List" => {
            authorize(state, p)?;
            Ok(serde_json::to_value(state.policies.list())?)
        }
        "PoliciesAPI.Create" => {
            authorize(state, p)?;
            let id: String = param(p, 1)?;
            let definition: PolicyDefinition = param(p, 2)?;
            Ok(serde_json::to_value(state.policies.create(&id, definition)?)?)
        }
        "PoliciesAPI.Remove" => {
            authorize(state, p)?;
            let id: String = param(p, 1)?;
            state.policies.remove(&id)?;
            Ok(Value::Bool(true))
        }
        "PoliciesAPI.Update" => {
            authorize(state, p)?;
            let id: String = param(p, 1)?;
            let definition: PolicyDefinition = param(p, 2)?;
            state.policies.update(&id, definition)?;
            Ok(Value::Bool(true))
        }
        "PoliciesAPI.Apply" => {
            authorize(state, p)?;
            let lambda: String = param(p, 1)?;
            let id: String = param(p, 2)?;
            state.policies.apply(&lambda, &id)?;
            Ok(Value::Bool(true))
        }
        "PoliciesAPI.Clear" => {
            authorize(state, p)?;
            let lambda: String = param(p, 1)?;
            state.policies.clear(&lambda)?;
            Ok(Value::Bool(true))
        }

        other => Err(Error::NotFound(format!("unknown method {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api;
    use crate::platform::{Registry, Workspace};
    use crate::queues::{BackendKind, Manager, PlatformDelivery};
    use crate::templates::TemplateStore;
    use crate::{policy, stats};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::Router;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let registry =
            Arc::new(Registry::open(dir.path().join("project.json"), "").unwrap());
        let policies =
            Arc::new(policy::Engine::open(dir.path().join("policies.json")).unwrap());
        let stats = Arc::new(stats::Recorder::open(dir.path().join(".stats"), 128).unwrap());
        let queues = Arc::new(
            Manager::open(
                dir.path().join("queues.json"),
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
        let templates = Arc::new(TemplateStore::new(dir.path().join(".templates")));
        let workspace = Arc::new(Workspace::new(
            dir.path(),
            registry.clone(),
            policies.clone(),
            templates,
            None,
        ));
        let auth = Arc::new(
            api::auth::AdminAuth::open(dir.path().join("server.json"), "hunter2").unwrap(),
        );
        let state = crate::state::AppState {
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
        Harness { app, _dir: dir }
    }

    async fn call(h: &Harness, method: &str, params: Value) -> Value {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = h
            .app
            .clone()
            .oneshot(
                HttpRequest::post("/u/")
                    .header("content-type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn login(h: &Harness) -> String {
        let reply = call(h, "UserAPI.Login", json!(["admin", "hunter2"])).await;
        reply["result"].as_str().expect("login result").to_string()
    }

    #[tokio::test]
    async fn login_and_authorized_call() {
        let h = harness();
        let token = login(&h).await;
        let reply = call(&h, "ProjectAPI.List", json!([token])).await;
        assert!(reply["result"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_token_is_rejected() {
        let h = harness();
        let reply = call(&h, "ProjectAPI.List", json!(["garbage"])).await;
        assert_eq!(reply["error"]["code"], 403);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let h = harness();
        let reply = call(&h, "UserAPI.Login", json!(["admin", "wrong"])).await;
        assert_eq!(reply["error"]["code"], 403);
    }

    #[tokio::test]
    async fn lambda_lifecycle_over_rpc() {
        let h = harness();
        let token = login(&h).await;

        let created = call(&h, "ProjectAPI.Create", json!([token])).await;
        let uid = created["result"]["uid"].as_str().unwrap().to_string();

        // update the manifest to an echo command
        let manifest = json!({
            "name": "echo",
            "run": ["/bin/cat", "-"],
            "output_headers": {},
            "public": true,
        });
        let updated = call(&h, "LambdaAPI.Update", json!([token, uid, manifest])).await;
        assert_eq!(updated["result"]["manifest"]["name"], "echo");

        // push a file and pull it back
        let content = BASE64.encode("print('hello')");
        call(&h, "LambdaAPI.Push", json!([token, uid, "app.py", content])).await;
        let pulled = call(&h, "LambdaAPI.Pull", json!([token, uid, "app.py"])).await;
        let raw = BASE64
            .decode(pulled["result"].as_str().unwrap())
            .unwrap();
        assert_eq!(raw, b"print('hello')");

        // link / info / unlink
        let linked = call(&h, "LambdaAPI.Link", json!([token, uid, "echo"])).await;
        assert!(linked["result"]["aliases"]
            .as_array()
            .unwrap()
            .iter()
            .any(|a| a == "echo"));
        let info = call(&h, "LambdaAPI.Info", json!([token, uid])).await;
        assert_eq!(info["result"]["uid"], uid.as_str());
        call(&h, "LambdaAPI.Unlink", json!([token, "echo"])).await;

        // download an archive and re-upload it
        let downloaded = call(&h, "LambdaAPI.Download", json!([token, uid])).await;
        let archive = downloaded["result"].as_str().unwrap().to_string();
        let uploaded = call(&h, "LambdaAPI.Upload", json!([token, uid, archive])).await;
        assert_eq!(uploaded["result"], true);

        // remove
        let removed = call(&h, "LambdaAPI.Remove", json!([token, uid])).await;
        assert_eq!(removed["result"], true);
        let gone = call(&h, "LambdaAPI.Info", json!([token, uid])).await;
        assert_eq!(gone["error"]["code"], 404);
    }

    #[tokio::test]
    async fn queue_create_requires_existing_target() {
        let h = harness();
        let token = login(&h).await;
        let reply = call(
            &h,
            "QueuesAPI.Create",
            json!([token, { "name": "calc", "target": "missing" }]),
        )
        .await;
        assert_eq!(reply["error"]["code"], 404);
    }

    #[tokio::test]
    async fn policy_crud_over_rpc() {
        let h = harness();
        let token = login(&h).await;
        let created = call(
            &h,
            "PoliciesAPI.Create",
            json!([token, "p1", { "public": false, "tokens": { "T": "t" } }]),
        )
        .await;
        assert_eq!(created["result"]["id"], "p1");
        call(&h, "PoliciesAPI.Apply", json!([token, "some-uid", "p1"])).await;
        let list = call(&h, "PoliciesAPI.List", json!([token])).await;
        assert!(list["result"][0]["lambdas"]
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l == "some-uid"));
        let removed = call(&h, "PoliciesAPI.Remove", json!([token, "p1"])).await;
        assert_eq!(removed["result"], true);
    }

    #[tokio::test]
    async fn unknown_method_is_404() {
        let h = harness();
        let reply = call(&h, "NoSuch.Method", json!([])).await;
        assert_eq!(reply["error"]["code"], 404);
    }
}
