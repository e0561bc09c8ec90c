//! Boundary triggers: axis-aligned boxes that send whoever walks into them
//! to another region.

use zoneweave_core::config::{PortalConfig, ZoneConfig};
use zoneweave_protocol::Position;

#[derive(Debug, Clone, PartialEq)]
pub struct Portal {
    pub name: String,
    pub min: Position,
    pub max: Position,
    pub destination: String,
    pub arrival: Position,
}

impl Portal {
    fn from_config(config: &PortalConfig) -> Self {
        let [min_x, min_y, min_z] = config.min;
        let [max_x, max_y, max_z] = config.max;
        let [arrival_x, arrival_y, arrival_z] = config.arrival;
        Self {
            name: config.name.clone(),
            min: Position::new(min_x, min_y, min_z),
            max: Position::new(max_x, max_y, max_z),
            destination: config.destination.clone(),
            arrival: Position::new(arrival_x, arrival_y, arrival_z),
        }
    }

    /// Inclusive on every face.
    pub fn contains(&self, position: Position) -> bool {
        (self.min.x..=self.max.x).contains(&position.x)
            && (self.min.y..=self.max.y).contains(&position.y)
            && (self.min.z..=self.max.z).contains(&position.z)
    }
}

/// The portals placed in one region.
#[derive(Debug, Clone, Default)]
pub struct PortalSet {
    portals: Vec<Portal>,
}

impl PortalSet {
    pub fn for_region(config: &ZoneConfig, region_path: &str) -> Self {
        Self {
            portals: config
                .portals
                .iter()
                .filter(|portal| portal.region == region_path)
                .map(Portal::from_config)
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.portals.len()
    }

    /// First portal containing `position`, in configuration order.
    pub fn triggered_by(&self, position: Position) -> Option<&Portal> {
        self.portals.iter().find(|portal| portal.contains(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ZoneConfig {
        ZoneConfig {
            regions: vec!["World1.unity".to_string(), "World2.unity".to_string()],
            portals: vec![
                PortalConfig {
                    name: "east_gate".to_string(),
                    region: "World1.unity".to_string(),
                    min: [4.0, -1.0, 4.0],
                    max: [6.0, 1.0, 6.0],
                    destination: "World2.unity".to_string(),
                    arrival: [0.0, 0.0, 0.0],
                },
                PortalConfig {
                    name: "west_gate".to_string(),
                    region: "World2.unity".to_string(),
                    min: [-1.0, -1.0, -1.0],
                    max: [1.0, 1.0, 1.0],
                    destination: "World1.unity".to_string(),
                    arrival: [3.0, 0.0, 3.0],
                },
            ],
            ..ZoneConfig::default()
        }
    }

    #[test]
    fn only_loads_portals_in_region() {
        let set = PortalSet::for_region(&config(), "World1.unity");
        assert_eq!(set.len(), 1);
        assert!(set.triggered_by(Position::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn boundary_is_inclusive() {
        let set = PortalSet::for_region(&config(), "World1.unity");
        let portal = set
            .triggered_by(Position::new(6.0, 1.0, 4.0))
            .expect("on the edge");
        assert_eq!(portal.name, "east_gate");
        assert!(set.triggered_by(Position::new(6.01, 0.0, 5.0)).is_none());
    }
}
