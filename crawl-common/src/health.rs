//! Health reporting for the long-lived loops of a process.
//!
//! Each loop registers a component and must re-report within its deadline;
//! the process is healthy only while every component is current. Liveness
//! and readiness probes should use separate registries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, before the first report.
    Starting,
    /// Healthy until the deadline passes without a new report.
    HealthyUntil(DateTime<Utc>),
    Unhealthy,
    /// Deadline passed without a report.
    Stalled,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy; must be called more often than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline))
            .await;
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(error) = self.sender.send(message).await {
            warn!(%error, "failed to report health status");
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(message.component, message.status);
                    }
                    Err(_) => warn!("health registry lock poisoned"),
                }
            }
        });

        registry
    }

    /// Register a component; hand the returned handle to its loop.
    pub async fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall status; usable directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let components = self.components.read().expect("health registry poisoned");
        let now = Utc::now();

        let mut status = HealthStatus {
            // A process with nothing registered yet is not ready.
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };
        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    status.healthy = false;
                    status.components.insert(name.clone(), other.clone());
                }
            }
        }
        if !status.healthy {
            warn!(registry = %self.name, "health check failed: {:?}", status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn reported_component_is_healthy_until_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("engine", Duration::seconds(60)).await;

        handle.report_healthy().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn stalled_component_fails_the_process() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("engine", Duration::milliseconds(-1)).await;

        handle.report_healthy().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("engine"),
            Some(&ComponentStatus::Stalled)
        );
    }
}
