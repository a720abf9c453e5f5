//! Daemon command line.

use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};

use sp_domain::HumanDuration;

fn duration(s: &str) -> Result<HumanDuration, String> {
    s.parse()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueBackendArg {
    /// Durable directory-per-queue storage.
    Directory,
    /// Bounded in-memory channels (nothing survives a restart).
    Memory,
}

/// Easy self-hosted platform exposing executable directories as HTTP
/// endpoints.
#[derive(Debug, Parser)]
#[command(name = "spawnpoint", version)]
pub struct Cli {
    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND", default_value = "127.0.0.1:3434")]
    pub bind: String,
    /// Enable HTTPS serving with TLS.
    #[arg(long, env = "TLS")]
    pub tls: bool,
    #[arg(long, env = "CERT_FILE", default_value = "server.crt")]
    pub cert_file: PathBuf,
    #[arg(long, env = "KEY_FILE", default_value = "server.key")]
    pub key_file: PathBuf,

    /// Project directory holding configuration and lambdas.
    #[arg(short, long, env = "DIR", default_value = ".")]
    pub dir: PathBuf,
    /// Starter templates directory.
    #[arg(long, env = "TEMPLATES", default_value = ".templates")]
    pub templates: PathBuf,
    /// Admin password used when `server.json` does not exist yet.
    #[arg(long, env = "INITIAL_ADMIN_PASSWORD", default_value = "admin")]
    pub initial_admin_password: String,
    /// OS user that spawned lambdas run as (empty keeps the daemon's own).
    #[arg(long, env = "EFFECTIVE_USER", default_value = "")]
    pub user: String,
    /// Path to the SSH key used for git cloning; generated when missing.
    /// An empty value disables SSH support.
    #[arg(long, env = "SSH_KEY", default_value = ".id_rsa")]
    pub ssh_key: String,

    /// Ring depth of the stats recorder.
    #[arg(long, env = "STATS_DEPTH", default_value_t = 8192)]
    pub stats_depth: usize,
    #[arg(long, env = "STATS_FILE", default_value = ".stats")]
    pub stats_file: PathBuf,
    /// Interval between stats dumps to disk.
    #[arg(long, env = "STATS_INTERVAL", default_value = "30s", value_parser = duration)]
    pub stats_interval: HumanDuration,
    /// Interval between cron checks.
    #[arg(long, env = "SCHEDULER_INTERVAL", default_value = "30s", value_parser = duration)]
    pub scheduler_interval: HumanDuration,

    /// Queue storage backend.
    #[arg(long, env = "QUEUE_BACKEND", value_enum, default_value_t = QueueBackendArg::Directory)]
    pub queue_backend: QueueBackendArg,
    /// Root directory for the directory backend.
    #[arg(long, env = "QUEUES_DIR", default_value = ".queues")]
    pub queues_dir: PathBuf,
    /// Channel depth for the memory backend.
    #[arg(long, env = "QUEUE_DEPTH", default_value_t = 1024)]
    pub queue_depth: usize,

    /// Trust X-Forwarded-For / X-Real-Ip for client addresses.
    #[arg(long, env = "BEHIND_PROXY")]
    pub behind_proxy: bool,
    /// Window for draining in-flight requests on shutdown.
    #[arg(long, env = "GRACEFUL_SHUTDOWN", default_value = "15s", value_parser = duration)]
    pub graceful_shutdown: HumanDuration,
    /// Dev mode: no credential dropping, permissive CORS on the admin API.
    #[arg(long, env = "DEV")]
    pub dev: bool,
}

impl Cli {
    /// Resolve a possibly-relative path against the project directory.
    pub fn in_project_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["spawnpoint"]);
        assert_eq!(cli.bind, "127.0.0.1:3434");
        assert_eq!(cli.stats_depth, 8192);
        assert_eq!(cli.queue_backend, QueueBackendArg::Directory);
        assert_eq!(cli.scheduler_interval, HumanDuration::from_secs(30));
        assert!(!cli.dev);
    }

    #[test]
    fn intervals_accept_human_durations() {
        let cli = Cli::parse_from([
            "spawnpoint",
            "--scheduler-interval",
            "1m30s",
            "--queue-backend",
            "memory",
        ]);
        assert_eq!(cli.scheduler_interval, HumanDuration::from_secs(90));
        assert_eq!(cli.queue_backend, QueueBackendArg::Memory);
    }

    #[test]
    fn paths_resolve_against_project_dir() {
        let cli = Cli::parse_from(["spawnpoint", "--dir", "/srv/sp"]);
        assert_eq!(
            cli.in_project_dir(Path::new(".stats")),
            PathBuf::from("/srv/sp/.stats")
        );
        assert_eq!(
            cli.in_project_dir(Path::new("/var/stats")),
            PathBuf::from("/var/stats")
        );
    }
}
