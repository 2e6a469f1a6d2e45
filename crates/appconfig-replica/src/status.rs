//! Store health as exposed to health-reporting consumers.
//!
//! The JSON rendering keeps the `UP`/`DOWN`/`NOT_LOADED` spellings used by
//! existing health endpoints.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Aggregate reachability of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreHealth {
    /// At least one replica is usable.
    Up,
    /// Every replica is backed off.
    Down,
    /// The store has not been loaded yet (or is disabled).
    NotLoaded,
}

impl StoreHealth {
    /// Wire spelling of the health value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::NotLoaded => "NOT_LOADED",
        }
    }
}

impl fmt::Display for StoreHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders per-store health as `{"<origin>": "UP", ...}`.
pub fn health_json(health: &BTreeMap<String, StoreHealth>) -> Value {
    let map: Map<String, Value> = health
        .iter()
        .map(|(origin, status)| (origin.clone(), Value::String(status.as_str().into())))
        .collect();
    Value::Object(map)
}

/// Folds per-store health into one value; any `Down` store makes the whole set `Down`.
pub fn overall_health(health: &BTreeMap<String, StoreHealth>) -> StoreHealth {
    if health.values().any(|h| *h == StoreHealth::Down) {
        StoreHealth::Down
    } else {
        StoreHealth::Up
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&StoreHealth::NotLoaded).unwrap(),
            "\"NOT_LOADED\""
        );
        let parsed: StoreHealth = serde_json::from_str("\"DOWN\"").unwrap();
        assert_eq!(parsed, StoreHealth::Down);
        assert_eq!(StoreHealth::Up.to_string(), "UP");
    }

    #[test]
    fn health_json_renders_every_store() {
        let health = BTreeMap::from([
            ("https://a.azconfig.io".to_string(), StoreHealth::Up),
            ("https://b.azconfig.io".to_string(), StoreHealth::NotLoaded),
        ]);
        assert_eq!(
            health_json(&health),
            serde_json::json!({
                "https://a.azconfig.io": "UP",
                "https://b.azconfig.io": "NOT_LOADED",
            })
        );
    }

    #[test]
    fn any_down_store_degrades_overall_health() {
        let mut health = BTreeMap::from([
            ("a".to_string(), StoreHealth::Up),
            ("b".to_string(), StoreHealth::NotLoaded),
        ]);
        assert_eq!(overall_health(&health), StoreHealth::Up);
        health.insert("c".into(), StoreHealth::Down);
        assert_eq!(overall_health(&health), StoreHealth::Down);
        assert_eq!(overall_health(&BTreeMap::new()), StoreHealth::Up);
    }
}
