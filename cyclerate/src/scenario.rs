//! ScenarioController — a registry of named activities
//!
//! Activities are identified by alias. Starting an alias that already exists
//! reuses its executor, so an activity that was stopped picks up from where it
//! left off with whatever definition it is started with. Drivers are factories
//! registered by name; an activity names its driver with `driver=` (or `type=`),
//! or, when it names none, the single registered driver contained in its alias
//! is used.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use typed_builder::TypedBuilder;

use crate::{
    ActivityDef, ActivityReport, CycleTally, ExecutorError, Result,
    executor::{Activity, ActivityExecutor, BoxError, ExecutorConfig},
};

/// Builds the [`Activity`] for a definition.
pub type ActivityFactory =
    Arc<dyn Fn(&ActivityDef) -> Result<Arc<dyn Activity>, BoxError> + Send + Sync>;

#[derive(TypedBuilder)]
pub struct ScenarioController {
    #[builder(default)]
    config: ExecutorConfig,
    #[builder(default, setter(skip))]
    drivers: RwLock<HashMap<String, ActivityFactory>>,
    #[builder(default, setter(skip))]
    activities: Mutex<BTreeMap<String, ActivityExecutor>>,
}

impl Default for ScenarioController {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ScenarioController {
    /// Registers a driver, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ActivityDef) -> Result<Arc<dyn Activity>, BoxError> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(target: "scenario", "Registered driver '{name}'");
        self.drivers.write().insert(name, Arc::new(factory));
    }

    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn executor(&self, alias: &str) -> Result<ActivityExecutor> {
        self.activities
            .lock()
            .get(alias)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownActivity(alias.to_string()))
    }

    fn resolve_driver(&self, def: &ActivityDef) -> Result<ActivityFactory> {
        let alias = def.alias();
        let drivers = self.drivers.read();
        match def.driver() {
            Some(driver) => drivers
                .get(driver)
                .cloned()
                .ok_or_else(|| ExecutorError::UnknownDriver {
                    alias: alias.clone(),
                    driver: driver.to_string(),
                }),
            None => {
                let mut matching = drivers.iter().filter(|(name, _)| alias.contains(name.as_str()));
                match (matching.next(), matching.next()) {
                    (Some((name, factory)), None) => {
                        tracing::debug!(target: "scenario", "Inferred driver '{name}' for '{alias}'");
                        Ok(factory.clone())
                    }
                    _ => Err(ExecutorError::MissingDriver { alias }),
                }
            }
        }
    }

    /// Starts an activity, creating it if the alias is new.
    pub async fn start(&self, def: ActivityDef) -> Result<ActivityExecutor> {
        let alias = def.alias();
        let existing = self.activities.lock().get(&alias).cloned();
        let executor = match existing {
            Some(executor) if executor.is_running() => {
                return Err(ExecutorError::AlreadyRunning(alias));
            }
            Some(executor) => {
                executor.modify(def).await?;
                executor
            }
            None => {
                let factory = self.resolve_driver(&def)?;
                let activity = factory(&def).map_err(|e| ExecutorError::ActivityInit {
                    alias: alias.clone(),
                    reason: e.to_string(),
                })?;
                let executor = ActivityExecutor::new(def, activity, self.config.clone());
                // a concurrent start of the same alias may have won
                self.activities
                    .lock()
                    .entry(alias.clone())
                    .or_insert(executor)
                    .clone()
            }
        };

        tracing::info!(target: "scenario", "Starting activity '{alias}'");
        executor.start_activity().await?;
        Ok(executor)
    }

    /// Parses `key=value;...` and starts the activity.
    pub async fn start_str(&self, def: &str) -> Result<ActivityExecutor> {
        self.start(def.parse()?).await
    }

    /// Starts an existing activity again with its current definition.
    pub async fn start_alias(&self, alias: &str) -> Result<ActivityExecutor> {
        let executor = self.executor(alias)?;
        if executor.is_running() {
            return Err(ExecutorError::AlreadyRunning(alias.to_string()));
        }
        executor.start_activity().await?;
        Ok(executor)
    }

    /// Starts an activity and waits for it to finish.
    pub async fn run(&self, def: ActivityDef, timeout: Duration) -> Result<ActivityReport> {
        let executor = self.start(def).await?;
        executor.await_finish(timeout).await?;
        Ok(executor.report().await)
    }

    pub async fn stop(&self, alias: &str) -> Result<()> {
        tracing::info!(target: "scenario", "Stopping activity '{alias}'");
        self.executor(alias)?.stop_activity().await
    }

    pub async fn force_stop(&self, alias: &str, grace: Duration) -> Result<()> {
        self.executor(alias)?.force_stop(grace).await;
        Ok(())
    }

    pub async fn force_stop_all(&self, grace: Duration) {
        let executors: Vec<_> = self.activities.lock().values().cloned().collect();
        futures::future::join_all(executors.iter().map(|e| e.force_stop(grace))).await;
    }

    pub async fn await_activity(&self, alias: &str, timeout: Duration) -> Result<()> {
        self.executor(alias)?.await_finish(timeout).await
    }

    /// Waits for every activity, returning the first error seen.
    pub async fn await_all(&self, timeout: Duration) -> Result<()> {
        let executors: Vec<_> = self.activities.lock().values().cloned().collect();
        let results =
            futures::future::join_all(executors.iter().map(|e| e.await_finish(timeout))).await;
        results.into_iter().collect()
    }

    /// Unknown aliases are not running.
    pub fn is_running(&self, alias: &str) -> bool {
        self.executor(alias).map(|e| e.is_running()).unwrap_or(false)
    }

    /// Sets one parameter of an activity.
    pub async fn modify(&self, alias: &str, param: &str, value: &str) -> Result<()> {
        tracing::debug!(target: "scenario", "Setting {param}={value} on '{alias}'");
        self.executor(alias)?.set_param(param, value).await
    }

    /// Modifies the activity if it exists, starts it otherwise.
    pub async fn apply(&self, def: ActivityDef) -> Result<()> {
        match self.executor(&def.alias()) {
            Ok(executor) => executor.modify(def).await,
            Err(_) => self.start(def).await.map(|_| ()),
        }
    }

    pub fn aliases(&self) -> Vec<String> {
        self.activities.lock().keys().cloned().collect()
    }

    pub fn activity(&self, alias: &str) -> Option<ActivityExecutor> {
        self.executor(alias).ok()
    }

    pub async fn activity_def(&self, alias: &str) -> Result<ActivityDef> {
        Ok(self.executor(alias)?.activity_def().await)
    }

    pub async fn report(&self, alias: &str) -> Result<ActivityReport> {
        Ok(self.executor(alias)?.report().await)
    }

    pub async fn tally(&self, alias: &str) -> Result<CycleTally> {
        Ok(self.executor(alias)?.tally().await)
    }
}
