use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use sp_ctl::archive;
use sp_ctl::client::{load_credentials, save_credentials, RpcClient, SavedCredentials};
use sp_ctl::control::ControlFile;
use sp_domain::{Manifest, MANIFEST_FILE};

/// Helper tool for a remote spawnpoint platform.
#[derive(Debug, Parser)]
#[command(name = "spctl", version)]
struct Cli {
    #[command(flatten)]
    remote: RemoteArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct RemoteArgs {
    /// Login name.
    #[arg(short, long, env = "LOGIN", default_value = "admin")]
    login: String,
    /// Password.
    #[arg(short, long, env = "PASSWORD", default_value = "admin")]
    password: String,
    /// Platform endpoint.
    #[arg(short, long, env = "URL", default_value = "http://127.0.0.1:3434/")]
    url: String,
    /// Do not save credentials to the user config dir.
    #[arg(long, env = "GHOST")]
    ghost: bool,
    /// Do not read credentials from the user config dir.
    #[arg(long, env = "INDEPENDENT")]
    independent: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new lambda on the remote platform and initialize the local
    /// working copy.
    Create {
        /// Project directory.
        dir: PathBuf,
    },
    /// Clone a remote lambda to the local FS and keep its UID for future
    /// tracking.
    Clone {
        uid: String,
        /// Target directory (defaults to the UID).
        dir: Option<PathBuf>,
    },
    /// Download lambda content as a tarball (`-` writes to stdout).
    Download {
        #[arg(short = 'i', long, env = "UID")]
        uid: Option<String>,
        #[arg(short, long, env = "OUTPUT")]
        output: Option<String>,
    },
    /// Upload the working copy to the remote lambda.
    Upload {
        #[arg(short = 'i', long, env = "UID")]
        uid: Option<String>,
        /// Directory to archive.
        #[arg(long, env = "INPUT", default_value = ".")]
        input: PathBuf,
    },
    /// Invoke actions; without arguments lists the available actions.
    Do {
        actions: Vec<String>,
    },
    /// List, create or remove aliases for the lambda.
    Alias {
        /// Delete the given aliases instead of adding them.
        #[arg(short, long, env = "DELETE")]
        delete: bool,
        aliases: Vec<String>,
    },
    /// Pull and save the remote manifest file.
    Update {
        #[command(subcommand)]
        what: UpdateCommand,
    },
    /// Call the lambda synchronously: stdin becomes the request body,
    /// stdout receives the response.
    Invoke {
        #[arg(short = 'i', long, env = "UID")]
        uid: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum UpdateCommand {
    Manifest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Create { dir } => create(cli.remote, &dir).await,
        Command::Clone { uid, dir } => clone(cli.remote, &uid, dir).await,
        Command::Download { uid, output } => download(cli.remote, uid, output).await,
        Command::Upload { uid, input } => upload(cli.remote, uid, &input).await,
        Command::Do { actions } => do_actions(cli.remote, actions).await,
        Command::Alias { delete, aliases } => alias(cli.remote, delete, aliases).await,
        Command::Update {
            what: UpdateCommand::Manifest,
        } => update_manifest(cli.remote).await,
        Command::Invoke { uid } => invoke(cli.remote, uid).await,
    }
}

/// Resolve the endpoint (control file wins), log in and cache the
/// credentials for the host.
async fn session(mut remote: RemoteArgs, dir: &Path) -> anyhow::Result<(RpcClient, String)> {
    if !remote.independent {
        if let Ok(cf) = ControlFile::load(dir) {
            remote.url = cf.url;
        }
        if let Some(saved) = load_credentials(&remote.url) {
            remote.login = saved.login;
            remote.password = saved.password;
        }
    }
    let client = RpcClient::new(&remote.url);
    tracing::info!(url = %client.base_url(), login = %remote.login, "login");
    let token = client.login(&remote.login, &remote.password).await?;
    if !remote.ghost {
        if let Err(e) = save_credentials(
            client.base_url(),
            &SavedCredentials {
                login: remote.login,
                password: remote.password,
            },
        ) {
            tracing::warn!(error = %e, "failed to cache credentials");
        }
    }
    Ok((client, token))
}

/// UID from the flag or from the control file in the working directory.
fn resolve_uid(explicit: Option<String>, dir: &Path) -> anyhow::Result<String> {
    if let Some(uid) = explicit {
        return Ok(uid);
    }
    let cf = ControlFile::load(dir)
        .context("no --uid given and no control file in the current directory")?;
    Ok(cf.uid)
}

async fn create(remote: RemoteArgs, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("preparing directory {}", dir.display()))?;
    let (client, token) = session(remote, dir).await?;

    tracing::info!("creating lambda");
    let info = client.call("ProjectAPI.Create", json!([token])).await?;
    let uid = info["uid"]
        .as_str()
        .context("create reply carries no uid")?
        .to_string();
    tracing::info!(uid = %uid, "created");

    ControlFile {
        url: client.base_url().to_string(),
        uid,
    }
    .save(dir)?;
    let manifest: Manifest = serde_json::from_value(info["manifest"].clone())?;
    manifest.save_as(&dir.join(MANIFEST_FILE))?;
    tracing::info!("done");
    Ok(())
}

async fn clone(remote: RemoteArgs, uid: &str, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| PathBuf::from(uid));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("preparing directory {}", dir.display()))?;
    let (client, token) = session(remote, &dir).await?;

    tracing::info!(uid, "downloading");
    let reply = client.call("LambdaAPI.Download", json!([token, uid])).await?;
    let tarball = BASE64
        .decode(reply.as_str().context("download reply is not base64")?)
        .context("decoding tarball")?;
    archive::unpack(&tarball, &dir)?;

    ControlFile {
        url: client.base_url().to_string(),
        uid: uid.to_string(),
    }
    .save(&dir)?;
    tracing::info!("done");
    Ok(())
}

async fn download(
    remote: RemoteArgs,
    uid: Option<String>,
    output: Option<String>,
) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let uid = resolve_uid(uid, &cwd)?;
    let (client, token) = session(remote, &cwd).await?;

    tracing::info!(uid = %uid, "downloading");
    let reply = client
        .call("LambdaAPI.Download", json!([token, uid]))
        .await?;
    let tarball = BASE64
        .decode(reply.as_str().context("download reply is not base64")?)
        .context("decoding tarball")?;

    let output = output.unwrap_or_else(|| format!("{uid}.tar.gz"));
    if output == "-" {
        std::io::stdout().write_all(&tarball)?;
    } else {
        tracing::info!(output = %output, "saving");
        std::fs::write(&output, &tarball)?;
    }
    tracing::info!("done");
    Ok(())
}

async fn upload(remote: RemoteArgs, uid: Option<String>, input: &Path) -> anyhow::Result<()> {
    let uid = resolve_uid(uid, input)?;
    let (client, token) = session(remote, input).await?;

    tracing::info!("archiving");
    let tarball = archive::pack(input)?;
    tracing::info!(uid = %uid, bytes = tarball.len(), "uploading");
    client
        .call(
            "LambdaAPI.Upload",
            json!([token, uid, BASE64.encode(&tarball)]),
        )
        .await?;
    tracing::info!("done");
    Ok(())
}

async fn do_actions(remote: RemoteArgs, actions: Vec<String>) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let uid = resolve_uid(None, &cwd)?;
    let (client, token) = session(remote, &cwd).await?;

    if actions.is_empty() {
        let list = client
            .call("LambdaAPI.Actions", json!([token, uid]))
            .await?;
        let list = list.as_array().cloned().unwrap_or_default();
        if list.is_empty() {
            tracing::info!("no available actions");
        }
        for action in list {
            if let Some(name) = action.as_str() {
                println!("{name}");
            }
        }
        return Ok(());
    }

    for action in actions {
        tracing::info!(action = %action, "invoking");
        let out = client
            .call("LambdaAPI.Invoke", json!([token, uid, action]))
            .await?;
        if let Some(text) = out.as_str() {
            print!("{text}");
        }
    }
    tracing::info!("done");
    Ok(())
}

async fn alias(remote: RemoteArgs, delete: bool, aliases: Vec<String>) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let uid = resolve_uid(None, &cwd)?;
    let (client, token) = session(remote, &cwd).await?;

    if aliases.is_empty() {
        let info = client.call("LambdaAPI.Info", json!([token, uid])).await?;
        for name in info["aliases"].as_array().cloned().unwrap_or_default() {
            if let Some(name) = name.as_str() {
                println!("{name}");
            }
        }
        return Ok(());
    }

    for name in aliases {
        if delete {
            tracing::info!(alias = %name, "removing");
            client.call("LambdaAPI.Unlink", json!([token, name])).await?;
        } else {
            tracing::info!(alias = %name, "adding");
            client
                .call("LambdaAPI.Link", json!([token, uid, name]))
                .await?;
        }
    }
    tracing::info!("done, refresh the local copy with: spctl update manifest");
    Ok(())
}

async fn update_manifest(remote: RemoteArgs) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let uid = resolve_uid(None, &cwd)?;
    let (client, token) = session(remote, &cwd).await?;

    let info = client.call("LambdaAPI.Info", json!([token, uid])).await?;
    let manifest: Manifest = serde_json::from_value(info["manifest"].clone())?;
    manifest.save_as(&cwd.join(MANIFEST_FILE))?;
    tracing::info!("manifest updated");
    Ok(())
}

async fn invoke(remote: RemoteArgs, uid: Option<String>) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let uid = resolve_uid(uid, &cwd)?;
    // resolve the endpoint like session() does, but without logging in:
    // the public route authenticates through policies, not the admin token
    let url = ControlFile::load(&cwd)
        .map(|cf| cf.url)
        .unwrap_or(remote.url);
    let mut body = Vec::new();
    std::io::stdin().read_to_end(&mut body)?;

    let base = url.trim_end_matches('/');
    let response = reqwest::Client::new()
        .post(format!("{base}/a/{uid}"))
        .body(body)
        .send()
        .await
        .context("calling lambda")?;
    let status = response.status();
    let bytes = response.bytes().await?;
    std::io::stdout().write_all(&bytes)?;
    if !status.is_success() {
        bail!("lambda responded with {status}");
    }
    Ok(())
}
