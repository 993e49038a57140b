//! API request and response models.

use interpose_core::{ControlAction, Target};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /api/start`. Missing fields come from saved settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub address: Option<String>,
    /// Number or string; anything that is not a valid port becomes 8080.
    #[serde(default)]
    pub port: Option<Value>,
}

impl StartRequest {
    /// Fills missing fields from `saved` and builds the control action.
    pub fn into_action(self, saved: Target) -> ControlAction {
        let address = self.address.unwrap_or_else(|| saved.address.to_string());
        let port = match self.port {
            None => saved.port.to_string(),
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            Some(_) => String::new(),
        };
        ControlAction::start(address, port)
    }
}

/// Response of `GET /api/settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub address: String,
    pub port: u16,
}

impl From<Target> for SettingsResponse {
    fn from(target: Target) -> Self {
        Self {
            address: target.address.to_string(),
            port: target.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn saved() -> Target {
        Target::parse("10.0.0.5", 8081).unwrap()
    }

    #[test]
    fn test_missing_fields_use_saved_target() {
        let action = StartRequest::default().into_action(saved());
        assert_eq!(action, ControlAction::start("10.0.0.5", "8081"));
    }

    #[test]
    fn test_port_forms() {
        let req: StartRequest = serde_json::from_value(json!({"port": "9090"})).unwrap();
        assert_eq!(req.into_action(saved()), ControlAction::start("10.0.0.5", "9090"));

        let req: StartRequest = serde_json::from_value(json!({"port": 9091})).unwrap();
        assert_eq!(req.into_action(saved()), ControlAction::start("10.0.0.5", "9091"));

        let req: StartRequest = serde_json::from_value(json!({"port": true})).unwrap();
        let target = req.into_action(saved()).target().unwrap().unwrap();
        assert_eq!(target.port, 8080);
    }
}
