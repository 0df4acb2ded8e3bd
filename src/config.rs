use crate::common::DomainResult;
use crate::domains::fleet::{Agv, AgvId};
use crate::domains::world::{Cell, WarehouseLayout, WorldMap};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub battery: BatteryConfig,
    #[serde(default)]
    pub dwell: DwellConfig,
    #[serde(default)]
    pub layout: WarehouseLayout,
    #[serde(default = "default_fleet")]
    pub fleet: Vec<AgvSpec>,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            battery: BatteryConfig::default(),
            dwell: DwellConfig::default(),
            layout: WarehouseLayout::default(),
            fleet: default_fleet(),
            postgres: None,
            kafka: None,
            demo: DemoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Duration of one discrete step.
    pub step_interval_ms: u64,
    pub dispatch_interval_ms: u64,
    /// Minimum battery (%) for an AGV to receive a transport task.
    pub dispatch_battery_threshold: f64,
    /// Idle AGVs below this battery (%) are sent to charge.
    pub low_battery_threshold: f64,
    pub search_horizon: u64,
    pub no_path_retry_budget: u32,
    /// Search-then-commit attempts before a reservation race counts as NoPath.
    pub commit_attempts: u32,
    /// Steps a mission waits on parked AGVs that hold its way before it fails.
    pub blocked_wait_limit_steps: u64,
    pub source: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_interval_ms: 100,
            dispatch_interval_ms: 200,
            dispatch_battery_threshold: 20.0,
            low_battery_threshold: 20.0,
            search_horizon: 500,
            no_path_retry_budget: 5,
            commit_attempts: 3,
            blocked_wait_limit_steps: 600,
            source: "agv-coordinator".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn dispatch_every_steps(&self) -> u64 {
        steps_for(self.dispatch_interval_ms, self.step_interval_ms).max(1)
    }
}

/// Battery rates in percent per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub move_drain: f64,
    pub dwell_drain: f64,
    pub idle_drain: f64,
    pub charge_rate: f64,
    pub charge_release_level: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            move_drain: 0.05,
            dwell_drain: 0.02,
            idle_drain: 0.01,
            charge_rate: 1.0,
            charge_release_level: 80.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DwellConfig {
    pub load_ms: u64,
    pub unload_ms: u64,
}

impl Default for DwellConfig {
    fn default() -> Self {
        Self {
            load_ms: 1500,
            unload_ms: 1500,
        }
    }
}

impl DwellConfig {
    pub fn load_steps(&self, step_interval_ms: u64) -> u64 {
        steps_for(self.load_ms, step_interval_ms)
    }

    pub fn unload_steps(&self, step_interval_ms: u64) -> u64 {
        steps_for(self.unload_ms, step_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgvSpec {
    pub id: String,
    pub row: u32,
    pub bay: u32,
    #[serde(default = "full_battery")]
    pub battery: f64,
}

impl AgvSpec {
    pub fn cell(&self) -> Cell {
        Cell::new(self.row, self.bay)
    }

    pub fn provision(&self, world: &WorldMap) -> Agv {
        let cell = self.cell();
        Agv::new(AgvId::new(self.id.clone()), cell, world.position(cell), self.battery)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "agv_coordinator".to_string(),
            username: "postgres".to_string(),
            password: "password".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "agv-coordinator".to_string(),
            topic: "agv-coordinator-events".to_string(),
        }
    }
}

/// Synthetic order generation for the binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Zero disables the generator.
    pub order_interval_ms: u64,
    pub seed: Option<u64>,
}

fn default_fleet() -> Vec<AgvSpec> {
    vec![
        AgvSpec {
            id: "AGV-01".to_string(),
            row: 3,
            bay: 1,
            battery: 100.0,
        },
        AgvSpec {
            id: "AGV-02".to_string(),
            row: 3,
            bay: 10,
            battery: 100.0,
        },
    ]
}

fn full_battery() -> f64 {
    100.0
}

fn steps_for(duration_ms: u64, step_interval_ms: u64) -> u64 {
    if step_interval_ms == 0 {
        return 0;
    }
    duration_ms.div_ceil(step_interval_ms)
}

impl Config {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// File (optional) layered with `AGV__SECTION__FIELD` environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path.as_ref()).format(::config::FileFormat::Toml),
            );
        }
        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("AGV")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Initial AGVs placed on the configured layout.
    pub fn provision_fleet(&self) -> DomainResult<Vec<Agv>> {
        let world = WorldMap::from_layout(&self.layout)?;
        Ok(self.fleet.iter().map(|spec| spec.provision(&world)).collect())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.coordinator;
        if c.step_interval_ms == 0 || c.dispatch_interval_ms == 0 {
            bail!("step and dispatch intervals must be positive");
        }
        if c.search_horizon == 0 {
            bail!("search_horizon must be positive");
        }
        if c.commit_attempts == 0 {
            bail!("commit_attempts must be positive");
        }
        if c.blocked_wait_limit_steps == 0 {
            bail!("blocked_wait_limit_steps must be positive");
        }
        for (name, value) in [
            ("dispatch_battery_threshold", c.dispatch_battery_threshold),
            ("low_battery_threshold", c.low_battery_threshold),
            ("charge_release_level", self.battery.charge_release_level),
        ] {
            if !(0.0..=100.0).contains(&value) {
                bail!("{} must be within 0..=100, got {}", name, value);
            }
        }
        if self.battery.charge_release_level <= c.low_battery_threshold {
            bail!("charge_release_level must exceed low_battery_threshold");
        }
        if self.battery.charge_rate <= 0.0 {
            bail!("charge_rate must be positive");
        }
        for spec in &self.fleet {
            if !(0.0..=100.0).contains(&spec.battery) {
                bail!("AGV {} battery must be within 0..=100", spec.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.coordinator.dispatch_every_steps(), 2);
        assert_eq!(config.dwell.load_steps(config.coordinator.step_interval_ms), 15);
        assert_eq!(config.coordinator.search_horizon, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.coordinator.low_battery_threshold = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn provisions_default_fleet_on_default_layout() {
        let agvs = Config::default().provision_fleet().unwrap();
        assert_eq!(agvs.len(), 2);
        assert_eq!(agvs[0].id.as_str(), "AGV-01");
        assert_eq!(agvs[0].cell, Cell::new(3, 1));
        assert_eq!(agvs[1].position.x, 18.0);
    }
}
