//! Component health for the liveness and readiness endpoints
//!
//! The sampler, the controller, each actuator and the state store report
//! into one shared [`HealthRegistry`]. Liveness is the worst component
//! status; readiness additionally requires startup to have finished.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered from best to worst so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still producing or holding load, but not as commanded
    Degraded,
    Unhealthy,
}

/// Last status a component reported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn observed(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::observed(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::observed(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::observed(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Overall status is the worst component status; no components is healthy
    pub fn from_components(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const SAMPLER: &str = "sampler";
    pub const CONTROLLER: &str = "controller";
    pub const CPU_ACTUATOR: &str = "cpu_actuator";
    pub const BANDWIDTH_ACTUATOR: &str = "bandwidth_actuator";
    pub const STATE_STORE: &str = "state_store";

    pub const ALL: [&str; 5] = [
        SAMPLER,
        CONTROLLER,
        CPU_ACTUATOR,
        BANDWIDTH_ACTUATOR,
        STATE_STORE,
    ];
}

#[derive(Debug, Default)]
struct Registry {
    components: HashMap<String, ComponentHealth>,
    /// Set once every loop has been spawned
    started: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Registry>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every agent component as healthy
    pub async fn register_all(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    pub async fn register(&self, name: &str) {
        self.record(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.record(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.record(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.started = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.inner.read().await.components.clone();
        HealthResponse::from_components(components)
    }

    /// Ready once started, and while no component is unhealthy
    ///
    /// The reason names the first unhealthy component, so a controller
    /// halted by emergency shutdown reports why.
    pub async fn readiness(&self) -> ReadinessResponse {
        let registry = self.inner.read().await;
        if !registry.started {
            return ReadinessResponse {
                ready: false,
                reason: Some("loadpilot is still starting".to_string()),
            };
        }

        let mut unhealthy: Vec<(&String, &ComponentHealth)> = registry
            .components
            .iter()
            .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
            .collect();
        unhealthy.sort_by(|a, b| a.0.cmp(b.0));

        match unhealthy.first() {
            Some((name, component)) => ReadinessResponse {
                ready: false,
                reason: Some(match &component.message {
                    Some(message) => format!("{name} unhealthy: {message}"),
                    None => format!("{name} unhealthy"),
                }),
            },
            None => ReadinessResponse {
                ready: true,
                reason: None,
            },
        }
    }

    async fn record(&self, name: &str, health: ComponentHealth) {
        self.inner
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }
}
