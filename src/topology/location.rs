use std::time::Instant;

use dashmap::DashMap;

/// Where a unit is currently served.
#[derive(Debug, Clone)]
pub struct UnitLocation {
    pub serving_rfss: String,
    pub updated_at: Instant,
}

/// Actor-location map: unit id to serving RFSS id.
///
/// Starts from the topology's configured serving nodes and is updated by
/// roaming scenarios for the lifetime of one run.
pub struct LocationMap {
    locations: DashMap<String, UnitLocation>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self {
            locations: DashMap::new(),
        }
    }

    /// Record that `unit` is now served by `rfss`. Returns the previous
    /// serving node, if any.
    pub fn move_unit(&self, unit: &str, rfss: &str) -> Option<String> {
        self.locations
            .insert(
                unit.to_string(),
                UnitLocation {
                    serving_rfss: rfss.to_string(),
                    updated_at: Instant::now(),
                },
            )
            .map(|previous| previous.serving_rfss)
    }

    pub fn serving_rfss(&self, unit: &str) -> Option<String> {
        self.locations.get(unit).map(|entry| entry.serving_rfss.clone())
    }

    /// Units currently served by `rfss`, sorted by id
    pub fn units_served_by(&self, rfss: &str) -> Vec<String> {
        let mut units: Vec<String> = self
            .locations
            .iter()
            .filter(|entry| entry.value().serving_rfss == rfss)
            .map(|entry| entry.key().clone())
            .collect();
        units.sort();
        units
    }
}

impl Default for LocationMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_and_lookup() {
        let map = LocationMap::new();
        assert!(map.move_unit("su_1", "rfss_1").is_none());
        assert_eq!(map.serving_rfss("su_1").as_deref(), Some("rfss_1"));
    }

    #[test]
    fn test_move_returns_previous_serving_node() {
        let map = LocationMap::new();
        map.move_unit("su_1", "rfss_1");
        assert_eq!(map.move_unit("su_1", "rfss_2").as_deref(), Some("rfss_1"));
        assert_eq!(map.serving_rfss("su_1").as_deref(), Some("rfss_2"));
    }

    #[test]
    fn test_unknown_unit_has_no_location() {
        assert!(LocationMap::new().serving_rfss("nobody").is_none());
    }

    #[test]
    fn test_units_served_by_is_sorted() {
        let map = LocationMap::new();
        map.move_unit("su_3", "rfss_1");
        map.move_unit("su_1", "rfss_1");
        map.move_unit("su_2", "rfss_2");
        assert_eq!(map.units_served_by("rfss_1"), vec!["su_1", "su_3"]);
    }
}
