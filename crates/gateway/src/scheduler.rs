//! Cron scheduler: a single ticker that walks a registry snapshot and runs
//! every due cron entry through the lambdas' actions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::platform::Registry;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub struct Scheduler {
    registry: Arc<Registry>,
    interval: Duration,
    /// End of the previous tick's window; starts at the epoch so entries
    /// fire once right after startup.
    last_tick: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Scheduler {
        Scheduler {
            registry,
            interval,
            last_tick: DateTime::UNIX_EPOCH,
        }
    }

    /// Tick until the token is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first interval tick fires immediately; skip it so entries do
        // not run while the platform is still starting
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            self.tick(&cancel).await;
        }
    }

    /// One pass: fire entries whose next occurrence after `last_tick` has
    /// arrived. Missed ticks coalesce to a single fire per entry.
    pub async fn tick(&mut self, cancel: &CancellationToken) {
        let now = Utc::now();
        let last = self.last_tick;
        self.last_tick = now;
        let env = self.registry.global_env();
        for def in self.registry.list() {
            def.lambda.run_scheduled(cancel, last, now, &env).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::lambda::tests::new_lambda;
    use sp_domain::{CronEntry, HumanDuration, Manifest};

    fn lambda_with_cron(dir: &std::path::Path, reg: &Registry) {
        let path = dir.join("11111111-2222-4333-8444-555555555555");
        std::fs::create_dir_all(&path).unwrap();
        let mut mf = Manifest::default();
        mf.cron.push(CronEntry {
            expression: "* * * * *".into(),
            action: "noop".into(),
            time_limit: HumanDuration::ZERO,
        });
        let fn_ = new_lambda(&path, mf);
        std::fs::write(fn_.root().join("Makefile"), "noop:\n\t@date >> fires.log\n").unwrap();
        reg.add("11111111-2222-4333-8444-555555555555", fn_).unwrap();
    }

    #[tokio::test]
    async fn fires_once_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(Registry::open(dir.path().join("project.json"), "").unwrap());
        lambda_with_cron(dir.path(), &reg);
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(reg.clone(), DEFAULT_INTERVAL);

        // simulate two ticks one minute apart
        scheduler.last_tick = Utc::now() - chrono::Duration::minutes(1);
        scheduler.tick(&cancel).await;
        let log = dir
            .path()
            .join("11111111-2222-4333-8444-555555555555/fires.log");
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);

        scheduler.last_tick = scheduler.last_tick - chrono::Duration::minutes(1);
        scheduler.tick(&cancel).await;
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn nothing_fires_before_the_minute_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Arc::new(Registry::open(dir.path().join("project.json"), "").unwrap());
        lambda_with_cron(dir.path(), &reg);
        let cancel = CancellationToken::new();
        let mut scheduler = Scheduler::new(reg, DEFAULT_INTERVAL);

        // a tick right after another observes no due entries
        scheduler.last_tick = Utc::now();
        scheduler.tick(&cancel).await;
        let log = dir
            .path()
            .join("11111111-2222-4333-8444-555555555555/fires.log");
        assert!(!log.exists());
    }
}
