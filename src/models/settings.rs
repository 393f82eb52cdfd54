//! Typed view of the `clients.settings` JSON column.
//!
//! Each entry is `{id, type, properties: [{name, value, editable, encrypted}]}`. Values whose
//! property is flagged `encrypted` hold a credential in the `iv:tag:ciphertext` format.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SettingProperty {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IntegrationSetting {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Vec<SettingProperty>,
}

impl IntegrationSetting {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            properties: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SettingProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|p| p.value.as_str())
    }

    pub fn is_encrypted(&self, name: &str) -> bool {
        self.get(name).is_some_and(|p| p.encrypted)
    }

    /// Inserts or replaces the named property.
    pub fn set(&mut self, name: &str, value: impl Into<String>, editable: bool, encrypted: bool) {
        let property = SettingProperty {
            name: name.to_string(),
            value: value.into(),
            editable,
            encrypted,
        };
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(existing) => *existing = property,
            None => self.properties.push(property),
        }
    }

    /// Builder form of [`IntegrationSetting::set`].
    pub fn with(mut self, name: &str, value: impl Into<String>, editable: bool, encrypted: bool) -> Self {
        self.set(name, value, editable, encrypted);
        self
    }
}

/// Replaces the entry with the same id, or appends it.
pub fn upsert_setting(settings: &mut Vec<IntegrationSetting>, setting: IntegrationSetting) {
    match settings.iter_mut().find(|s| s.id == setting.id) {
        Some(existing) => *existing = setting,
        None => settings.push(setting),
    }
}

/// Removes the entry with `id`, returning whether one was present.
pub fn remove_setting(settings: &mut Vec<IntegrationSetting>, id: &str) -> bool {
    let before = settings.len();
    settings.retain(|s| s.id != id);
    settings.len() != before
}

pub fn find_setting<'a>(settings: &'a [IntegrationSetting], id: &str) -> Option<&'a IntegrationSetting> {
    settings.iter().find(|s| s.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stored_shape() {
        let raw = json!([{
            "id": "fitbit",
            "type": "integration",
            "properties": [
                {"name": "userId", "value": "ABC123", "editable": false, "encrypted": false},
                {"name": "accessToken", "value": "a:b:c", "editable": false, "encrypted": true}
            ]
        }]);
        let settings: Vec<IntegrationSetting> = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(settings[0].kind, "integration");
        assert_eq!(settings[0].value("userId"), Some("ABC123"));
        assert!(settings[0].is_encrypted("accessToken"));
        assert!(!settings[0].is_encrypted("userId"));
        assert_eq!(serde_json::to_value(&settings).unwrap(), raw);
    }

    #[test]
    fn set_replaces_existing_property() {
        let mut setting = IntegrationSetting::new("fitbit", "integration").with("expiresAt", "1", false, false);
        setting.set("expiresAt", "2", false, false);
        assert_eq!(setting.properties.len(), 1);
        assert_eq!(setting.value("expiresAt"), Some("2"));
    }

    #[test]
    fn upsert_and_remove_by_id() {
        let mut settings = vec![IntegrationSetting::new("theme", "preference")];
        upsert_setting(&mut settings, IntegrationSetting::new("fitbit", "integration"));
        upsert_setting(
            &mut settings,
            IntegrationSetting::new("fitbit", "integration").with("userId", "X", false, false),
        );
        assert_eq!(settings.len(), 2);
        assert_eq!(find_setting(&settings, "fitbit").unwrap().value("userId"), Some("X"));

        assert!(remove_setting(&mut settings, "fitbit"));
        assert!(!remove_setting(&mut settings, "fitbit"));
        assert_eq!(settings.len(), 1);
    }
}
