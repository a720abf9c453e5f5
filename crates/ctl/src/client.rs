//! JSON-RPC client for the platform's admin endpoint, plus credential
//! caching in the user config directory (one file per host, so several
//! platforms can be used side by side).

use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const CONFIG_SECTION: &str = "spawnpoint-ctl";

pub struct RpcClient {
    base_url: String,
    http: reqwest::Client,
}

impl RpcClient {
    /// `base_url` is the platform root (e.g. `http://127.0.0.1:3434/`);
    /// the admin endpoint lives under `u/`.
    pub fn new(base_url: &str) -> RpcClient {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        RpcClient {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let reply: Value = self
            .http
            .post(format!("{}u/", self.base_url))
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("calling {method}"))?
            .json()
            .await
            .with_context(|| format!("decoding {method} reply"))?;
        if let Some(err) = reply.get("error") {
            bail!(
                "{method}: {} (code {})",
                err["message"].as_str().unwrap_or("unknown error"),
                err["code"]
            );
        }
        Ok(reply["result"].clone())
    }

    pub async fn login(&self, login: &str, password: &str) -> anyhow::Result<String> {
        let token = self
            .call("UserAPI.Login", json!([login, password]))
            .await?;
        token
            .as_str()
            .map(String::from)
            .context("login reply is not a token")
    }
}

/// Saved credentials for one platform host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedCredentials {
    pub login: String,
    pub password: String,
}

fn credentials_path(base_url: &str) -> anyhow::Result<PathBuf> {
    let parsed = url::Url::parse(base_url).context("parsing platform URL")?;
    let host = parsed
        .host_str()
        .context("platform URL has no host")?
        .to_string();
    let file = match parsed.port() {
        Some(port) => format!("{host}_{port}"),
        None => host,
    };
    let dir = dirs::config_dir().context("no user config directory")?;
    Ok(dir.join(CONFIG_SECTION).join(file))
}

pub fn load_credentials(base_url: &str) -> Option<SavedCredentials> {
    let path = credentials_path(base_url).ok()?;
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

pub fn save_credentials(base_url: &str, creds: &SavedCredentials) -> anyhow::Result<()> {
    let path = credentials_path(base_url)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_vec_pretty(creds)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
