//! Simulated system configuration.
//!
//! The simulator executes against a configurable device description instead
//! of real hardware. The builtin configuration models a current discrete
//! GPU; tests and applications can construct their own [`DeviceConfig`],
//! load one from JSON, or point the `SIMSYCL_SYSTEM` environment variable at
//! a configuration file. The default schedule policy is likewise selected
//! through `SIMSYCL_SCHEDULE` (`round_robin`, `shuffle` or `shuffle:<seed>`).
//!
//! Defaults are resolved lazily and process-wide, but nothing in the engine
//! consults them implicitly: the dispatchers take the device and the
//! schedule as explicit arguments, so tests can pass their own without
//! touching the environment.

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schedule::{CooperativeSchedule, RoundRobinSchedule};

/// Identifier for devices within a [`SystemConfig`].
pub type DeviceId = String;

/// Fallback sub-group width when a device config lists none.
pub const DEFAULT_SUB_GROUP_SIZE: usize = 32;

/// Execution-relevant limits of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    /// Bounds the number of work-groups simulated concurrently (the fiber
    /// pool holds `max_compute_units * work_group_size` fibers at most).
    pub max_compute_units: u32,
    pub max_work_item_dimensions: u32,
    pub max_work_item_sizes_1: [usize; 1],
    pub max_work_item_sizes_2: [usize; 2],
    pub max_work_item_sizes_3: [usize; 3],
    pub max_work_group_size: usize,
    pub max_num_sub_groups: u32,
    pub sub_group_sizes: Vec<usize>,
    pub local_mem_size: u64,
}

impl DeviceConfig {
    /// Widest supported sub-group; work-groups are sliced into sub-groups
    /// of this many lanes (the last slice may be smaller).
    pub fn sub_group_max_size(&self) -> usize {
        self.sub_group_sizes
            .first()
            .copied()
            .unwrap_or(DEFAULT_SUB_GROUP_SIZE)
    }

    /// Per-dimension work-item limit for a dispatch of `dimensions`
    /// dimensions.
    pub fn max_work_item_size(&self, dimensions: usize, dimension: usize) -> usize {
        match dimensions {
            1 => self.max_work_item_sizes_1[dimension],
            2 => self.max_work_item_sizes_2[dimension],
            3 => self.max_work_item_sizes_3[dimension],
            _ => 0,
        }
    }
}

/// Configuration of the entire simulated system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Devices by id; the id is only meaningful within this struct.
    pub devices: BTreeMap<DeviceId, DeviceConfig>,
}

/// Configuration of the builtin device, modelled after a discrete GPU.
pub fn builtin_device() -> DeviceConfig {
    DeviceConfig {
        name: "SimSYCL virtual GPU".to_owned(),
        max_compute_units: 82,
        max_work_item_dimensions: 3,
        max_work_item_sizes_1: [1024],
        max_work_item_sizes_2: [1024, 1024],
        max_work_item_sizes_3: [64, 1024, 1024],
        max_work_group_size: 1024,
        max_num_sub_groups: 32,
        sub_group_sizes: vec![32],
        local_mem_size: 48 << 10,
    }
}

/// The system configuration used when the environment does not override it.
pub fn builtin_system() -> SystemConfig {
    SystemConfig {
        devices: BTreeMap::from([("gpu".to_owned(), builtin_device())]),
    }
}

/// Read a [`SystemConfig`] from a JSON file.
pub fn read_system_config(path: impl AsRef<Path>) -> Result<SystemConfig> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write a [`SystemConfig`] to a JSON file.
pub fn write_system_config(path: impl AsRef<Path>, config: &SystemConfig) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

static DEFAULT_SYSTEM: Lazy<SystemConfig> = Lazy::new(|| {
    let Some(path) = std::env::var_os("SIMSYCL_SYSTEM") else {
        return builtin_system();
    };
    match read_system_config(&path) {
        Ok(config) if !config.devices.is_empty() => config,
        Ok(_) => {
            log::warn!(
                "system configuration {} does not define any devices, falling back to the builtin system",
                Path::new(&path).display(),
            );
            builtin_system()
        }
        Err(err) => {
            log::warn!(
                "could not load system configuration from {}: {err}, falling back to the builtin system",
                Path::new(&path).display(),
            );
            builtin_system()
        }
    }
});

/// The system configuration selected through `SIMSYCL_SYSTEM`, or
/// [`builtin_system`] as a fallback. Resolved once per process.
pub fn default_system_config() -> &'static SystemConfig {
    &DEFAULT_SYSTEM
}

/// The first device of [`default_system_config`].
pub fn default_device() -> &'static DeviceConfig {
    default_system_config()
        .devices
        .values()
        .next()
        .expect("the default system config defines at least one device")
}

static DEFAULT_SCHEDULE: Lazy<Box<dyn CooperativeSchedule + Send + Sync>> = Lazy::new(|| {
    let Ok(spec) = std::env::var("SIMSYCL_SCHEDULE") else {
        return Box::new(RoundRobinSchedule);
    };
    match spec.parse::<crate::schedule::ScheduleSpec>() {
        Ok(spec) => spec.into_schedule(),
        Err(err) => {
            log::warn!("{err}, falling back to the round-robin schedule");
            Box::new(RoundRobinSchedule)
        }
    }
});

/// The schedule policy selected through `SIMSYCL_SCHEDULE`, or round-robin
/// as a fallback. Resolved once per process.
pub fn default_schedule() -> &'static dyn CooperativeSchedule {
    &**DEFAULT_SCHEDULE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_device_is_consistent() {
        let device = builtin_device();
        assert_eq!(device.sub_group_max_size(), 32);
        assert_eq!(device.max_work_item_size(3, 0), 64);
        assert_eq!(device.max_work_item_size(1, 0), 1024);
        assert!(builtin_system().devices.values().next() == Some(&device));
    }

    #[test]
    fn system_config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.json");

        let mut config = builtin_system();
        config
            .devices
            .get_mut("gpu")
            .unwrap()
            .sub_group_sizes = vec![16];
        write_system_config(&path, &config).unwrap();

        let loaded = read_system_config(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.devices["gpu"].sub_group_max_size(), 16);
    }

    #[test]
    fn unknown_config_fields_are_rejected() {
        let json = r#"{"devices": {"gpu": {"name": "x", "frobnication_factor": 9}}}"#;
        assert!(serde_json::from_str::<SystemConfig>(json).is_err());
    }
}
