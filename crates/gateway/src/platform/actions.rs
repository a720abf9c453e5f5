//! Named actions of a lambda: `make` targets runnable on demand or from
//! cron entries.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use sp_domain::Result;
use sp_invoker::InvokeSpec;

use crate::cron;

use super::lambda::LocalLambda;

fn targets_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_/-]+)\s*:").expect("targets regex"))
}

impl LocalLambda {
    /// Target names from the project's `Makefile`; empty when there is none.
    pub fn actions(&self) -> Result<Vec<String>> {
        let makefile = self.root().join("Makefile");
        let content = match std::fs::read_to_string(&makefile) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut targets = Vec::new();
        for line in content.lines() {
            if let Some(captures) = targets_pattern().captures(line) {
                targets.push(captures[1].to_string());
            }
        }
        Ok(targets)
    }

    /// Run `make <name>` in the lambda root with the merged environment.
    pub async fn do_action<W>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        time_limit: Duration,
        global_env: &BTreeMap<String, String>,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (manifest, creds) = {
            let state = self.state.read();
            (state.manifest.clone(), state.creds)
        };
        let mut env = global_env.clone();
        for (k, v) in &manifest.environment {
            env.insert(k.clone(), v.clone());
        }
        let argv = vec!["make".to_string(), name.to_string()];
        sp_invoker::invoke(
            cancel,
            InvokeSpec {
                argv: &argv,
                cwd: self.root(),
                env: &env,
                credentials: creds,
                time_limit,
                max_payload: 0,
            },
            tokio::io::empty(),
            out,
        )
        .await
    }

    /// Fire every cron entry whose next occurrence after `last` is not past
    /// `now`. Failures are logged and do not stop the remaining entries.
    pub async fn run_scheduled(
        &self,
        cancel: &CancellationToken,
        last: DateTime<Utc>,
        now: DateTime<Utc>,
        global_env: &BTreeMap<String, String>,
    ) {
        let entries = self.state.read().manifest.cron.clone();
        for entry in entries {
            let due = match cron::cron_next(&entry.expression, &last) {
                Some(next) => next <= now,
                None => {
                    tracing::warn!(
                        uid = %self.uid(),
                        expression = %entry.expression,
                        "invalid cron expression, skipping"
                    );
                    continue;
                }
            };
            if !due {
                continue;
            }
            let mut sink = tokio::io::sink();
            if let Err(e) = self
                .do_action(
                    cancel,
                    &entry.action,
                    entry.time_limit.as_duration(),
                    global_env,
                    &mut sink,
                )
                .await
            {
                tracing::error!(
                    uid = %self.uid(),
                    action = %entry.action,
                    expression = %entry.expression,
                    error = %e,
                    "scheduled action failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::lambda::tests::new_lambda;
    use sp_domain::{CronEntry, Manifest};

    #[test]
    fn actions_lists_makefile_targets() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = new_lambda(dir.path(), Manifest::default());
        std::fs::write(
            fn_.root().join("Makefile"),
            "build:\n\t@echo build\n\ndeploy/prod: build\n\t@echo deploy\n\n.PHONY: build\n",
        )
        .unwrap();
        let actions = fn_.actions().unwrap();
        assert_eq!(actions, vec!["build".to_string(), "deploy/prod".to_string()]);
    }

    #[test]
    fn actions_without_makefile_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = new_lambda(dir.path(), Manifest::default());
        assert!(fn_.actions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn do_action_runs_make_target() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = new_lambda(dir.path(), Manifest::default());
        std::fs::write(
            fn_.root().join("Makefile"),
            "greet:\n\t@printf 'hello from make'\n",
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        fn_.do_action(&cancel, "greet", Duration::ZERO, &BTreeMap::new(), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello from make");
    }

    #[tokio::test]
    async fn run_scheduled_fires_due_entries_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = Manifest::default();
        mf.cron.push(CronEntry {
            expression: "* * * * *".into(),
            action: "tick".into(),
            time_limit: sp_domain::HumanDuration::ZERO,
        });
        let fn_ = new_lambda(dir.path(), mf);
        std::fs::write(
            fn_.root().join("Makefile"),
            "tick:\n\t@date +%s%N >> ticks.log\n",
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let now = Utc::now();
        let last = now - chrono::Duration::minutes(1);
        fn_.run_scheduled(&cancel, last, now, &BTreeMap::new()).await;
        let ticks = std::fs::read_to_string(fn_.root().join("ticks.log")).unwrap();
        assert_eq!(ticks.lines().count(), 1, "one fire per entry per tick");

        // an entry that is not yet due does not fire
        fn_.run_scheduled(&cancel, now, now, &BTreeMap::new()).await;
        let ticks = std::fs::read_to_string(fn_.root().join("ticks.log")).unwrap();
        assert_eq!(ticks.lines().count(), 1);
    }

    #[tokio::test]
    async fn run_scheduled_skips_invalid_expressions() {
        let dir = tempfile::tempdir().unwrap();
        let mut mf = Manifest::default();
        mf.cron.push(CronEntry {
            expression: "not a cron".into(),
            action: "boom".into(),
            time_limit: sp_domain::HumanDuration::ZERO,
        });
        mf.cron.push(CronEntry {
            expression: "* * * * *".into(),
            action: "tick".into(),
            time_limit: sp_domain::HumanDuration::ZERO,
        });
        let fn_ = new_lambda(dir.path(), mf);
        std::fs::write(fn_.root().join("Makefile"), "tick:\n\t@touch ticked\n").unwrap();
        let cancel = CancellationToken::new();
        let now = Utc::now();
        fn_.run_scheduled(&cancel, now - chrono::Duration::minutes(2), now, &BTreeMap::new())
            .await;
        assert!(fn_.root().join("ticked").exists());
    }
}
