//! Runtime settings registry
//!
//! A name-keyed store of [`SettingValue`]s shared through the
//! [`RenderContext`](crate::render::RenderContext). Primitive values get their
//! own variant; anything else serializable goes through the RON-encoded
//! `Generic` arm.
//!
//! Settings persist as a `key=value` text file. When loading, a value is parsed
//! into the variant already registered under its key, so register defaults
//! before calling [`Settings::load_file`]. Unknown keys load as text.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use ash::vk;
use serde::{de::DeserializeOwned, Serialize};

/// Well-known setting keys
pub mod keys {
    /// Force a tear-free FIFO present mode
    pub const VSYNC: &str = "vsync";
    /// Raw `VkPresentModeKHR` value tried first when vsync is off
    pub const PREFERRED_PRESENT_MODE: &str = "preferred_present_mode";
}

/// Settings errors
#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed line in a settings file
    #[error("Parse error on line {line}: {reason}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Stored value has a different type than requested
    #[error("Setting '{key}' is not a {expected}")]
    TypeMismatch {
        /// Setting name
        key: String,
        /// Requested type
        expected: &'static str,
    },

    /// RON encoding or decoding of a generic value failed
    #[error("Generic value error: {0}")]
    Generic(String),
}

/// One stored setting
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    /// Boolean flag
    Bool(bool),
    /// Unsigned integer
    U32(u32),
    /// Signed integer
    I32(i32),
    /// Float
    F32(f32),
    /// Free text
    Text(String),
    /// RON-encoded value of any serde type
    Generic(String),
}

impl SettingValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::U32(_) => "u32",
            Self::I32(_) => "i32",
            Self::F32(_) => "f32",
            Self::Text(_) => "text",
            Self::Generic(_) => "generic",
        }
    }

    /// Parse `raw` into the same variant as `self`
    fn parse_like(&self, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match self {
            Self::Bool(_) => match raw {
                "true" | "1" | "on" => Ok(Self::Bool(true)),
                "false" | "0" | "off" => Ok(Self::Bool(false)),
                other => Err(format!("'{other}' is not a boolean")),
            },
            Self::U32(_) => raw.parse().map(Self::U32).map_err(|e| e.to_string()),
            Self::I32(_) => raw.parse().map(Self::I32).map_err(|e| e.to_string()),
            Self::F32(_) => raw.parse().map(Self::F32).map_err(|e| e.to_string()),
            Self::Text(_) => Ok(Self::Text(raw.to_string())),
            Self::Generic(_) => Ok(Self::Generic(raw.to_string())),
        }
    }

    fn to_file_string(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::U32(v) => v.to_string(),
            Self::I32(v) => v.to_string(),
            Self::F32(v) => v.to_string(),
            Self::Text(v) | Self::Generic(v) => v.clone(),
        }
    }
}

/// Thread-safe settings registry
#[derive(Debug, Default)]
pub struct Settings {
    values: RwLock<BTreeMap<String, SettingValue>>,
}

impl Settings {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the engine's defaults
    pub fn with_defaults() -> Self {
        let settings = Self::new();
        settings.set(keys::VSYNC, SettingValue::Bool(false));
        settings.set(
            keys::PREFERRED_PRESENT_MODE,
            SettingValue::U32(vk::PresentModeKHR::MAILBOX.as_raw() as u32),
        );
        settings
    }

    /// Store a value, replacing whatever was there
    pub fn set(&self, key: &str, value: SettingValue) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    /// Raw lookup
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether a key is registered
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Boolean lookup; `None` when missing or of another type
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            SettingValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Unsigned lookup; `None` when missing or of another type
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            SettingValue::U32(v) => Some(v),
            _ => None,
        }
    }

    /// Signed lookup; `None` when missing or of another type
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.get(key)? {
            SettingValue::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Float lookup; `None` when missing or of another type
    pub fn get_f32(&self, key: &str) -> Option<f32> {
        match self.get(key)? {
            SettingValue::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Text lookup; `None` when missing or of another type
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Store any serde value in the generic arm
    pub fn set_generic<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SettingsError> {
        let encoded = ron::to_string(value).map_err(|e| SettingsError::Generic(e.to_string()))?;
        self.set(key, SettingValue::Generic(encoded));
        Ok(())
    }

    /// Decode a value stored with [`Settings::set_generic`]
    pub fn get_generic<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SettingsError> {
        match self.get(key) {
            None => Ok(None),
            Some(SettingValue::Generic(encoded)) => ron::from_str(&encoded)
                .map(Some)
                .map_err(|e| SettingsError::Generic(e.to_string())),
            Some(_) => Err(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "generic",
            }),
        }
    }

    /// Merge a `key=value` file into the registry
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<usize, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        self.load_str(&contents)
    }

    /// Merge `key=value` text into the registry, returning how many entries were read
    pub fn load_str(&self, contents: &str) -> Result<usize, SettingsError> {
        let mut parsed = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, raw) = line.split_once('=').ok_or_else(|| SettingsError::Parse {
                line: index + 1,
                reason: format!("expected key=value, got '{line}'"),
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(SettingsError::Parse {
                    line: index + 1,
                    reason: "empty key".to_string(),
                });
            }
            let value = match self.get(key) {
                Some(existing) => existing.parse_like(raw).map_err(|reason| SettingsError::Parse {
                    line: index + 1,
                    reason: format!("{key} ({}): {reason}", existing.type_name()),
                })?,
                None => SettingValue::Text(raw.trim().to_string()),
            };
            parsed.push((key.to_string(), value));
        }

        // Apply only once the whole file parsed
        let count = parsed.len();
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.extend(parsed);
        log::debug!("Loaded {count} settings");
        Ok(count)
    }

    /// Render the registry as `key=value` lines, sorted by key
    pub fn to_file_string(&self) -> String {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values
            .iter()
            .map(|(key, value)| format!("{key}={}\n", value.to_file_string()))
            .collect()
    }

    /// Write the registry to a `key=value` file
    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<(), SettingsError> {
        std::fs::write(path, self.to_file_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ClearColor {
        r: f32,
        g: f32,
        b: f32,
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::with_defaults();
        assert_eq!(settings.get_bool(keys::VSYNC), Some(false));
        assert_eq!(
            settings.get_u32(keys::PREFERRED_PRESENT_MODE),
            Some(vk::PresentModeKHR::MAILBOX.as_raw() as u32)
        );
    }

    #[test]
    fn test_typed_getter_rejects_other_variant() {
        let settings = Settings::new();
        settings.set("count", SettingValue::U32(3));
        assert_eq!(settings.get_u32("count"), Some(3));
        assert_eq!(settings.get_bool("count"), None);
        assert_eq!(settings.get_f32("missing"), None);
    }

    #[test]
    fn test_generic_arm() {
        let settings = Settings::new();
        let color = ClearColor { r: 0.1, g: 0.2, b: 0.3 };
        settings.set_generic("clear_color", &color).unwrap();
        let loaded: Option<ClearColor> = settings.get_generic("clear_color").unwrap();
        assert_eq!(loaded, Some(color));

        settings.set("flag", SettingValue::Bool(true));
        assert!(matches!(
            settings.get_generic::<ClearColor>("flag"),
            Err(SettingsError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_load_parses_into_registered_variant() {
        let settings = Settings::with_defaults();
        settings.set("gamma", SettingValue::F32(2.2));
        let count = settings
            .load_str("# comment\nvsync = true\n\ngamma=1.8\nplayer_name=ada\n")
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(settings.get_bool(keys::VSYNC), Some(true));
        assert_eq!(settings.get_f32("gamma"), Some(1.8));
        assert_eq!(settings.get_text("player_name"), Some("ada".to_string()));
    }

    #[test]
    fn test_load_reports_bad_line_and_applies_nothing() {
        let settings = Settings::with_defaults();
        let result = settings.load_str("vsync=false\nvsync=maybe\n");
        match result {
            Err(SettingsError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert_eq!(settings.get_bool(keys::VSYNC), Some(false));

        assert!(settings.load_str("no separator").is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.cfg");

        let settings = Settings::with_defaults();
        settings.set(keys::VSYNC, SettingValue::Bool(true));
        settings.set("lod_bias", SettingValue::I32(-2));
        settings.save_file(&path).unwrap();

        let reloaded = Settings::with_defaults();
        reloaded.set("lod_bias", SettingValue::I32(0));
        reloaded.load_file(&path).unwrap();
        assert_eq!(reloaded.get_bool(keys::VSYNC), Some(true));
        assert_eq!(reloaded.get_i32("lod_bias"), Some(-2));
        assert_eq!(reloaded.len(), settings.len());
    }
}
