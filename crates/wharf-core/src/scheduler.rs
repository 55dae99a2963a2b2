//! Scheduled container updates
//!
//! One background trigger fires on a cron schedule and sweeps every
//! registered engine, updating the containers whose names match the
//! configured patterns. Reconfiguration validates the new schedule before
//! touching the running trigger, so a bad expression never disarms a
//! working one.

use crate::error::{Error, Result};
use crate::models::UpdateJobConfig;
use crate::runtime::RuntimeRegistry;
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct SchedulerState {
    config: UpdateJobConfig,
    trigger: Option<JoinHandle<()>>,
}

/// Cron-driven update job over all registered runtime backends.
pub struct UpdateScheduler {
    registry: Arc<RuntimeRegistry>,
    state: RwLock<SchedulerState>,
}

impl UpdateScheduler {
    pub fn new(registry: Arc<RuntimeRegistry>) -> Self {
        Self {
            registry,
            state: RwLock::new(SchedulerState {
                config: UpdateJobConfig::default(),
                trigger: None,
            }),
        }
    }

    /// Replace the job configuration, rearming or disarming the trigger.
    ///
    /// An invalid schedule on an enabled config is rejected up front and
    /// leaves the previous configuration and trigger untouched.
    pub async fn update_config(self: &Arc<Self>, config: UpdateJobConfig) -> Result<()> {
        let schedule = if config.enabled {
            Some(parse_schedule(&config.schedule)?)
        } else {
            None
        };

        let mut state = self.state.write().await;
        if let Some(trigger) = state.trigger.take() {
            trigger.abort();
        }
        state.config = config;

        if let Some(schedule) = schedule {
            info!(schedule = %state.config.schedule, "Arming update trigger");
            let weak = Arc::downgrade(self);
            state.trigger = Some(tokio::spawn(trigger_loop(weak, schedule)));
        } else {
            debug!("Update trigger disarmed");
        }
        Ok(())
    }

    pub async fn get_config(&self) -> UpdateJobConfig {
        self.state.read().await.config.clone()
    }

    /// Whether a trigger task is currently scheduled.
    pub async fn is_armed(&self) -> bool {
        self.state.read().await.trigger.is_some()
    }

    /// Sweep every registered engine once, updating matching containers.
    /// Per-container failures are logged and do not stop the sweep.
    /// Returns the number of containers updated.
    pub async fn run_update(&self) -> usize {
        let filters = self.state.read().await.config.filters.clone();
        let mut updated = 0usize;

        for (name, backend) in self.registry.all() {
            let containers = match backend.list_containers(&Default::default()).await {
                Ok(containers) => containers,
                Err(err) => {
                    error!(backend = %name, error = %err, "Failed to list containers for update sweep");
                    continue;
                }
            };

            for container in containers {
                if !matches_filter(&container.name, &filters) {
                    continue;
                }
                match backend.update_container(&container.id).await {
                    Ok(()) => {
                        info!(backend = %name, container = %container.name, "Container updated");
                        updated += 1;
                    }
                    Err(err) => {
                        error!(backend = %name, container = %container.name, error = %err, "Container update failed");
                    }
                }
            }
        }

        updated
    }
}

async fn trigger_loop(scheduler: Weak<UpdateScheduler>, schedule: Schedule) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("Update schedule has no future occurrences; trigger exiting");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(next = %next, "Update trigger sleeping until next occurrence");
        tokio::time::sleep(wait).await;

        // The scheduler owning this trigger may have been dropped while we
        // slept; stop rather than keep a dead job alive.
        let Some(scheduler) = scheduler.upgrade() else {
            return;
        };
        let updated = scheduler.run_update().await;
        info!(updated, "Scheduled update sweep finished");
    }
}

/// Parse a cron expression, accepting the common five-field form by
/// assuming second zero.
fn parse_schedule(expression: &str) -> Result<Schedule> {
    let normalized = normalize_schedule(expression);
    Schedule::from_str(&normalized)
        .map_err(|err| Error::InvalidInput(format!("invalid cron expression {expression:?}: {err}")))
}

fn normalize_schedule(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// A container matches when any pattern and its name contain one another.
/// Patterns are literal text; an empty filter list matches everything.
fn matches_filter(name: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters
        .iter()
        .any(|pattern| pattern.is_empty() || name.contains(pattern.as_str()) || pattern.contains(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ContainerRecord, Engine, FilterOptions, PodRecord, RunRequest,
    };
    use crate::runtime::{async_trait, ContainerRuntime, LogStream};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    struct RecordingRuntime {
        names: Vec<(&'static str, &'static str)>,
        updated: Mutex<Vec<String>>,
    }

    impl RecordingRuntime {
        fn new(names: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                names,
                updated: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        fn engine(&self) -> Engine {
            Engine::Docker
        }

        async fn list_containers(
            &self,
            _filter: &FilterOptions,
        ) -> crate::error::Result<Vec<ContainerRecord>> {
            Ok(self
                .names
                .iter()
                .map(|(id, name)| ContainerRecord {
                    id: id.to_string(),
                    name: name.to_string(),
                    image: "img".to_string(),
                    status: "Up 5 minutes".to_string(),
                    state: "running".to_string(),
                    engine: Engine::Docker,
                    created: Utc::now(),
                    labels: HashMap::new(),
                    ports: Vec::new(),
                    privileged: None,
                    stats: None,
                })
                .collect())
        }

        async fn list_pods(&self, _filter: &FilterOptions) -> crate::error::Result<Vec<PodRecord>> {
            Ok(Vec::new())
        }

        async fn delete_container(&self, _id: &str, _force: bool) -> crate::error::Result<()> {
            Ok(())
        }

        async fn start_container(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn stop_container(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn restart_container(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn delete_pod(&self, _id: &str, _force: bool) -> crate::error::Result<()> {
            Ok(())
        }

        async fn start_pod(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn stop_pod(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn restart_pod(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn build_image(
            &self,
            _dockerfile: &str,
            _image_name: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }

        async fn run_container(&self, _request: &RunRequest) -> crate::error::Result<String> {
            Ok("new".to_string())
        }

        async fn deploy_compose(
            &self,
            _compose: &str,
            _project_name: &str,
            _deploy_dir: Option<&Path>,
        ) -> crate::error::Result<()> {
            Ok(())
        }

        async fn pull_image(&self, _image: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn update_container(&self, id: &str) -> crate::error::Result<()> {
            self.updated.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn stream_logs(
            &self,
            _id: &str,
            _follow: bool,
            _tail: Option<u64>,
        ) -> crate::error::Result<LogStream> {
            Err(Error::Unsupported("not implemented".into()))
        }

        async fn set_labels(
            &self,
            _id: &str,
            _labels: &HashMap<String, String>,
        ) -> crate::error::Result<()> {
            Ok(())
        }

        async fn remove_labels(&self, _id: &str, _keys: &[String]) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn scheduler_with(backend: Arc<RecordingRuntime>) -> Arc<UpdateScheduler> {
        let registry = Arc::new(RuntimeRegistry::new());
        registry.register("docker", backend);
        Arc::new(UpdateScheduler::new(registry))
    }

    #[test]
    fn five_field_schedules_gain_a_seconds_field() {
        assert_eq!(normalize_schedule("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_schedule("30 0 2 * * *"), "30 0 2 * * *");
        assert_eq!(normalize_schedule("nonsense"), "nonsense");
    }

    #[test]
    fn filters_are_literal_substrings_in_either_direction() {
        // Empty list matches everything.
        assert!(matches_filter("anything", &[]));

        let filters = vec!["web".to_string()];
        assert!(matches_filter("web-frontend", &filters));
        // Pattern longer than the name still matches when it contains it.
        assert!(matches_filter("w", &filters));
        assert!(!matches_filter("api", &filters));

        // Wildcards are not expanded.
        let glob = vec!["app-*".to_string()];
        assert!(!matches_filter("app-web", &glob));
        assert!(matches_filter("app-*-old", &glob));
    }

    #[tokio::test]
    async fn enabling_with_valid_schedule_arms_the_trigger() {
        let scheduler = scheduler_with(Arc::new(RecordingRuntime::new(vec![])));
        assert!(!scheduler.is_armed().await);

        let config = UpdateJobConfig {
            schedule: "0 2 * * *".to_string(),
            enabled: true,
            filters: vec![],
        };
        scheduler.update_config(config).await.unwrap();
        assert!(scheduler.is_armed().await);

        // Disabling disarms without error.
        scheduler
            .update_config(UpdateJobConfig::default())
            .await
            .unwrap();
        assert!(!scheduler.is_armed().await);
    }

    #[tokio::test]
    async fn invalid_schedule_preserves_previous_state() {
        let scheduler = scheduler_with(Arc::new(RecordingRuntime::new(vec![])));
        let good = UpdateJobConfig {
            schedule: "0 3 * * *".to_string(),
            enabled: true,
            filters: vec!["web".to_string()],
        };
        scheduler.update_config(good).await.unwrap();

        let bad = UpdateJobConfig {
            schedule: "whenever".to_string(),
            enabled: true,
            filters: vec![],
        };
        let result = scheduler.update_config(bad).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        // The working trigger and its config survive the rejection.
        assert!(scheduler.is_armed().await);
        let config = scheduler.get_config().await;
        assert_eq!(config.schedule, "0 3 * * *");
        assert_eq!(config.filters, vec!["web"]);
    }

    #[tokio::test]
    async fn reenabling_replaces_the_trigger() {
        let scheduler = scheduler_with(Arc::new(RecordingRuntime::new(vec![])));
        let config = UpdateJobConfig {
            schedule: "0 2 * * *".to_string(),
            enabled: true,
            filters: vec![],
        };
        scheduler.update_config(config.clone()).await.unwrap();
        scheduler
            .update_config(UpdateJobConfig {
                schedule: "0 4 * * *".to_string(),
                ..config
            })
            .await
            .unwrap();

        assert!(scheduler.is_armed().await);
        assert_eq!(scheduler.get_config().await.schedule, "0 4 * * *");
    }

    #[tokio::test]
    async fn sweep_updates_only_matching_containers() {
        let backend = Arc::new(RecordingRuntime::new(vec![
            ("c1", "web-frontend"),
            ("c2", "api-server"),
            ("c3", "web-worker"),
        ]));
        let scheduler = scheduler_with(Arc::clone(&backend));

        scheduler
            .update_config(UpdateJobConfig {
                schedule: "0 2 * * *".to_string(),
                enabled: false,
                filters: vec!["web".to_string()],
            })
            .await
            .unwrap();

        let updated = scheduler.run_update().await;
        assert_eq!(updated, 2);
        let ids = backend.updated.lock().unwrap().clone();
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn sweep_with_no_filters_updates_everything() {
        let backend = Arc::new(RecordingRuntime::new(vec![("c1", "a"), ("c2", "b")]));
        let scheduler = scheduler_with(Arc::clone(&backend));

        let updated = scheduler.run_update().await;
        assert_eq!(updated, 2);
    }
}
