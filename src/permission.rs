//! Permission resolution: maps a user's saved tool toggles onto the
//! plugin ids that are actually allowed to load, factoring in which
//! secrets are present. Resolution never fails — missing secrets only
//! produce warnings, never an error, since a degraded tool set is
//! always a valid outcome.

use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolManifestEntry {
    pub plugin_ids: Vec<String>,
    pub requires_secret: Option<String>,
    pub default_enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolSettings {
    pub enabled_tools: HashSet<String>,
}

/// Port over wherever secrets actually live (env vars, a keychain, a
/// config file) — the resolver only needs presence/absence.
pub trait SecretStore {
    fn get(&self, name: &str) -> Option<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolLoadWarningReason {
    MissingSecret,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolLoadWarning {
    pub reason: ToolLoadWarningReason,
    pub id: String,
    pub secret_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionResolution {
    pub allowed_plugin_ids: HashSet<String>,
    pub warnings: Vec<ToolLoadWarning>,
    /// Every plugin id named by some toggle in the manifest. A plugin
    /// outside this set is unrestricted by this resolver — callers should
    /// treat it as allowed even though it never appears in
    /// `allowed_plugin_ids`.
    pub restricted_plugin_ids: HashSet<String>,
}

impl PermissionResolution {
    /// Whether `plugin_id` may load: explicitly allowed, or simply never
    /// named by any toggle (and thus unrestricted).
    pub fn is_allowed(&self, plugin_id: &str) -> bool {
        self.allowed_plugin_ids.contains(plugin_id) || !self.restricted_plugin_ids.contains(plugin_id)
    }
}

/// Resolves which plugin ids may load given saved toggle settings (or
/// manifest defaults if no settings were saved), the authoritative tool
/// manifest, and the secrets actually available.
///
/// - No saved settings → every toggle with `default_enabled = true` is
///   treated as selected.
/// - A selected toggle whose `requires_secret` is unset in `secrets` is
///   dropped (its plugin ids are withheld) and emits a warning.
/// - Unknown toggle ids in `settings` are silently ignored.
/// - A plugin not named by any toggle in the manifest is unrestricted.
pub fn resolve(
    settings: Option<&ToolSettings>,
    manifest: &HashMap<String, ToolManifestEntry>,
    secrets: &dyn SecretStore,
) -> PermissionResolution {
    let selected_toggles: Vec<&String> = match settings {
        Some(settings) => manifest
            .keys()
            .filter(|id| settings.enabled_tools.contains(*id))
            .collect(),
        None => manifest
            .iter()
            .filter(|(_, entry)| entry.default_enabled)
            .map(|(id, _)| id)
            .collect(),
    };

    let mut allowed_plugin_ids = HashSet::new();
    let mut warnings = Vec::new();
    let manifest_plugin_ids: HashSet<&String> =
        manifest.values().flat_map(|entry| entry.plugin_ids.iter()).collect();

    for toggle_id in selected_toggles {
        let entry = &manifest[toggle_id];

        if let Some(secret_id) = &entry.requires_secret {
            if secrets.get(secret_id).is_none() {
                warnings.push(ToolLoadWarning {
                    reason: ToolLoadWarningReason::MissingSecret,
                    id: toggle_id.clone(),
                    secret_id: secret_id.clone(),
                });
                continue;
            }
        }

        allowed_plugin_ids.extend(entry.plugin_ids.iter().cloned());
    }

    PermissionResolution {
        allowed_plugin_ids,
        warnings,
        restricted_plugin_ids: manifest_plugin_ids.into_iter().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapSecretStore(HashMap<String, String>);

    impl SecretStore for MapSecretStore {
        fn get(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    fn manifest() -> HashMap<String, ToolManifestEntry> {
        let mut manifest = HashMap::new();
        manifest.insert(
            "web_search".to_string(),
            ToolManifestEntry {
                plugin_ids: vec!["search_plugin".to_string()],
                requires_secret: Some("SEARCH_API_KEY".to_string()),
                default_enabled: false,
            },
        );
        manifest.insert(
            "sandbox".to_string(),
            ToolManifestEntry {
                plugin_ids: vec!["sandbox_plugin".to_string()],
                requires_secret: None,
                default_enabled: true,
            },
        );
        manifest
    }

    #[test]
    fn no_saved_settings_enables_defaults_only() {
        let secrets = MapSecretStore(HashMap::new());
        let resolution = resolve(None, &manifest(), &secrets);
        assert!(resolution.allowed_plugin_ids.contains("sandbox_plugin"));
        assert!(!resolution.allowed_plugin_ids.contains("search_plugin"));
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn missing_secret_withholds_plugin_and_warns() {
        let settings = ToolSettings {
            enabled_tools: ["web_search".to_string()].into_iter().collect(),
        };
        let secrets = MapSecretStore(HashMap::new());
        let resolution = resolve(Some(&settings), &manifest(), &secrets);

        assert!(!resolution.allowed_plugin_ids.contains("search_plugin"));
        assert_eq!(resolution.warnings.len(), 1);
        assert_eq!(resolution.warnings[0].id, "web_search");
        assert_eq!(resolution.warnings[0].secret_id, "SEARCH_API_KEY");
    }

    #[test]
    fn present_secret_allows_plugin() {
        let settings = ToolSettings {
            enabled_tools: ["web_search".to_string()].into_iter().collect(),
        };
        let mut secret_map = HashMap::new();
        secret_map.insert("SEARCH_API_KEY".to_string(), "sk-test".to_string());
        let secrets = MapSecretStore(secret_map);

        let resolution = resolve(Some(&settings), &manifest(), &secrets);
        assert!(resolution.allowed_plugin_ids.contains("search_plugin"));
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn unknown_toggle_ids_are_dropped_silently() {
        let settings = ToolSettings {
            enabled_tools: ["not_a_real_toggle".to_string()].into_iter().collect(),
        };
        let secrets = MapSecretStore(HashMap::new());
        let resolution = resolve(Some(&settings), &manifest(), &secrets);
        assert!(resolution.allowed_plugin_ids.is_empty());
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn plugin_outside_the_manifest_is_unrestricted() {
        let settings = ToolSettings::default();
        let secrets = MapSecretStore(HashMap::new());
        let resolution = resolve(Some(&settings), &manifest(), &secrets);

        // sandbox_plugin is named by a toggle and wasn't selected: restricted, not allowed.
        assert!(!resolution.is_allowed("sandbox_plugin"));
        // a plugin no toggle ever names is unrestricted.
        assert!(resolution.is_allowed("some_unlisted_plugin"));
    }
}
