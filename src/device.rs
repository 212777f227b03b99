use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::error::{HarnessError, Result};

pub type DeviceId = u32;

/// Non-empty ordered set of compute devices one model instance is loaded onto.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "Vec<DeviceId>", into = "Vec<DeviceId>")]
pub struct DeviceSet {
    ids: Vec<DeviceId>,
}

impl DeviceSet {
    pub fn new(ids: Vec<DeviceId>) -> Result<Self> {
        if ids.is_empty() {
            return Err(HarnessError::InvalidDeviceSet(
                "at least one device id is required".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(*id) {
                return Err(HarnessError::InvalidDeviceSet(format!(
                    "device {} listed more than once",
                    id
                )));
            }
        }
        Ok(Self { ids })
    }

    pub fn ids(&self) -> &[DeviceId] {
        &self.ids
    }

    pub fn primary(&self) -> DeviceId {
        self.ids[0]
    }
}

impl TryFrom<Vec<DeviceId>> for DeviceSet {
    type Error = HarnessError;

    fn try_from(ids: Vec<DeviceId>) -> Result<Self> {
        Self::new(ids)
    }
}

impl From<DeviceSet> for Vec<DeviceId> {
    fn from(set: DeviceSet) -> Self {
        set.ids
    }
}

/// Parses the comma separated `--devid` form, e.g. `"0,1"`.
impl FromStr for DeviceSet {
    type Err = HarnessError;

    fn from_str(raw: &str) -> Result<Self> {
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<DeviceId>()
                    .map_err(|_| HarnessError::InvalidDeviceSet(format!("invalid device id '{}'", s)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(ids)
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

/// Tracks which devices are currently owned by a loaded model instance.
///
/// Cloning the registry shares the same occupancy table.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    occupied: Rc<RefCell<HashSet<DeviceId>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims every device in `set`, or none of them.
    pub fn claim(&self, set: &DeviceSet) -> Result<DeviceLease> {
        let mut occupied = self.occupied.borrow_mut();
        if let Some(busy) = set.ids().iter().find(|id| occupied.contains(*id)) {
            return Err(HarnessError::DeviceBusy { device: *busy });
        }
        occupied.extend(set.ids().iter().copied());
        Ok(DeviceLease {
            devices: set.clone(),
            occupied: Rc::clone(&self.occupied),
        })
    }

    pub fn is_occupied(&self, id: DeviceId) -> bool {
        self.occupied.borrow().contains(&id)
    }
}

/// Exclusive hold on a [`DeviceSet`]; released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    devices: DeviceSet,
    occupied: Rc<RefCell<HashSet<DeviceId>>>,
}

impl DeviceLease {
    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut occupied = self.occupied.borrow_mut();
        for id in self.devices.ids() {
            occupied.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devid_list() {
        let set: DeviceSet = "0, 2,1".parse().expect("device list");
        assert_eq!(set.ids(), &[0, 2, 1]);
        assert_eq!(set.primary(), 0);
        assert_eq!(set.to_string(), "0,2,1");
    }

    #[test]
    fn rejects_empty_and_duplicate_sets() {
        assert!(matches!(
            "".parse::<DeviceSet>(),
            Err(HarnessError::InvalidDeviceSet(_))
        ));
        assert!(matches!(
            DeviceSet::new(vec![1, 1]),
            Err(HarnessError::InvalidDeviceSet(_))
        ));
        assert!("0,x".parse::<DeviceSet>().is_err());
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let registry = DeviceRegistry::new();
        let first = DeviceSet::new(vec![0, 1]).expect("set");
        let overlapping = DeviceSet::new(vec![1, 2]).expect("set");

        let lease = registry.claim(&first).expect("first claim");
        assert_eq!(
            registry.claim(&overlapping).expect_err("overlap must fail"),
            HarnessError::DeviceBusy { device: 1 }
        );
        // a failed claim must not leave device 2 marked
        assert!(!registry.is_occupied(2));

        drop(lease);
        assert!(!registry.is_occupied(0));
        let _again = registry.claim(&overlapping).expect("claim after release");
    }
}
