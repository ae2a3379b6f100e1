use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: Status,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: Status,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    /// Aggregates per-component health: degraded if any component is unhealthy;
    /// unhealthy only if the bus connection or the subscriber is down.
    pub fn aggregate(components: Vec<ComponentHealth>, critical: &[&str]) -> Self {
        let any_unhealthy = components.iter().any(|c| c.status != Status::Healthy);
        let critical_down = components
            .iter()
            .any(|c| critical.contains(&c.name.as_str()) && c.status == Status::Unhealthy);
        let overall = if critical_down {
            Status::Unhealthy
        } else if any_unhealthy {
            Status::Degraded
        } else {
            Status::Healthy
        };
        HealthReport { overall, components }
    }
}
