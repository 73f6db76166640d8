//! Bounded executor acquisition per environment.

use kiln_core::pipeline::EnvironmentDescriptor;
use kiln_core::ports::{ExecutionContext, Executor};
use kiln_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent contexts per environment when not listed in `capacities`.
    pub default_capacity: usize,
    /// Per-environment overrides, keyed by executor name.
    pub capacities: HashMap<String, usize>,
    /// How long an acquisition may wait for a free slot.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_capacity: 4,
            capacities: HashMap::new(),
            acquire_timeout_secs: 300,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn capacity_for(&self, environment: &str) -> usize {
        self.capacities
            .get(environment)
            .copied()
            .unwrap_or(self.default_capacity)
    }
}

/// An acquired context holding its environment slot until released.
pub struct PooledContext {
    pub context: ExecutionContext,
    _permit: OwnedSemaphorePermit,
}

pub struct ExecutorPool {
    executor: Arc<dyn Executor>,
    config: PoolConfig,
    acquire_timeout: Duration,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ExecutorPool {
    pub fn new(executor: Arc<dyn Executor>, config: PoolConfig) -> Self {
        let acquire_timeout = config.acquire_timeout();
        Self {
            executor,
            config,
            acquire_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Override the acquisition wait; mostly useful in tests.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    async fn semaphore(&self, environment: &str) -> Arc<Semaphore> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(environment.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.capacity_for(environment))))
            .clone()
    }

    /// Free slots for an environment.
    pub async fn available(&self, environment: &str) -> usize {
        self.semaphore(environment).await.available_permits()
    }

    /// Wait for a slot, then acquire a fresh context from the executor.
    pub async fn acquire(&self, environment: &str, descriptor: &EnvironmentDescriptor) -> Result<PooledContext> {
        let semaphore = self.semaphore(environment).await;
        let permit = match tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::ExecutorUnavailable {
                    environment: environment.to_string(),
                    message: "pool closed".to_string(),
                });
            }
            Err(_) => {
                warn!(environment, timeout_ms = self.acquire_timeout.as_millis() as u64, "Executor acquisition timed out");
                return Err(Error::ExecutorUnavailable {
                    environment: environment.to_string(),
                    message: format!(
                        "no free slot within {}s",
                        self.acquire_timeout.as_secs_f64()
                    ),
                });
            }
        };

        let context = self.executor.acquire(environment, descriptor).await?;
        debug!(environment, executor_id = %context.id, "Executor slot taken");
        Ok(PooledContext {
            context,
            _permit: permit,
        })
    }

    /// Tear the context down and return its slot.
    pub async fn release(&self, pooled: PooledContext) -> Result<()> {
        let PooledContext { context, _permit } = pooled;
        let environment = context.environment.clone();
        let result = self.executor.release(context).await;
        debug!(environment = %environment, "Executor slot returned");
        result
    }
}
