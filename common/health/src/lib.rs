use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

/// Liveness reporting for the long-running loops of the relay.
///
/// Every watched collection runs its own loop, and the process can only be
/// trusted to move change events forward if all of them are still turning.
/// Each loop registers a component and keeps pushing its deadline forward;
/// a component that misses its deadline is reported as stalled.
///
/// The registry answers a single probe. Readiness, if ever needed, should get
/// its own registry instead of sharing this one.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when at least one component is registered and all of them are live
    pub healthy: bool,
    /// Per-component status, rendered in the probe body
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self)).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Must report again before this instant
    HealthyUntil(OffsetDateTime),
    /// Reported itself unhealthy, with a reason
    Unhealthy(String),
    /// Derived when a `HealthyUntil` deadline has passed
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Push this component's deadline forward. Must be called more often than the deadline.
    pub fn report_healthy(&self) {
        self.set(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_unhealthy(&self, reason: impl Into<String>) {
        self.set(ComponentStatus::Unhealthy(reason.into()))
    }

    fn set(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component, starting in `Starting`. Registering an existing name resets it.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.set(ComponentStatus::Starting);
        handle
    }

    /// Combined status of all registered components. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let current = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(current, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), current);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("watcher:sku", Duration::seconds(30));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("watcher:sku"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_unhealthy("feed closed");
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("watcher:sku"),
            Some(&ComponentStatus::Unhealthy("feed closed".to_string()))
        );
    }

    #[test]
    fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("watcher:sku", Duration::seconds(-1));
        handle.report_healthy();

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("watcher:sku"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn one_stalled_watcher_fails_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let live = registry.register("watcher:sku", Duration::seconds(30));
        let stalled = registry.register("watcher:brand", Duration::seconds(-1));

        live.report_healthy();
        stalled.report_healthy();
        assert!(!registry.get_status().healthy);

        let stalled = registry.register("watcher:brand", Duration::seconds(30));
        stalled.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn probe_status_codes() {
        assert_eq!(
            HealthStatus::default().into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        };
        assert_eq!(ok.into_response().status(), StatusCode::OK);
    }
}
