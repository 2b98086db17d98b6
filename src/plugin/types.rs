//! Plugin type definitions
//!
//! Identity, version ordering and manifest metadata shared by the archive, the
//! registered plugin handle and the manager.

use crate::core::error::{Result, SfxError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Unique identifier for a plugin archive: `name@version`
pub type PluginId = String;

/// Manifest attribute holding the plugin display name
pub const ATTR_NAME: &str = "Plugin-Name";
/// Manifest attribute holding the plugin version
pub const ATTR_VERSION: &str = "Plugin-Version";
/// Manifest attribute holding the plugin description
pub const ATTR_DESCRIPTION: &str = "Plugin-Description";
/// Manifest attribute holding the plugin type marker
pub const ATTR_TYPE: &str = "Plugin-Type";
/// Manifest attribute naming the activation class
pub const ATTR_CLASS: &str = "Plugin-Class";
/// Manifest attribute naming the icon shown by the setup wizard
pub const ATTR_ICON_NAME: &str = "Setup-Wizard-Icon-Name";

/// Interface every plugin class ultimately implements
pub const PLUGIN_INTERFACE: &str = "sfx.plugin.Plugin";

/// Plugin type marker
///
/// Each type maps to the capability interface the host queries plugins by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginType {
    /// Content extension inserting content into slides
    ContentExtension,
    /// Markup converter
    Markup,
    /// Code snippet executor
    SnippetExecutor,
    /// Connector to a remote hosting service
    HostingConnector,
    /// Anything else
    Generic,
}

impl PluginType {
    pub const ALL: [PluginType; 5] = [
        PluginType::ContentExtension,
        PluginType::Markup,
        PluginType::SnippetExecutor,
        PluginType::HostingConnector,
        PluginType::Generic,
    ];

    /// Capability interface plugins of this type implement
    pub fn interface(&self) -> &'static str {
        match self {
            PluginType::ContentExtension => "sfx.content.ContentExtension",
            PluginType::Markup => "sfx.markup.Markup",
            PluginType::SnippetExecutor => "sfx.snippet.SnippetExecutor",
            PluginType::HostingConnector => "sfx.hosting.HostingConnector",
            PluginType::Generic => PLUGIN_INTERFACE,
        }
    }
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginType::ContentExtension => write!(f, "content-extension"),
            PluginType::Markup => write!(f, "markup"),
            PluginType::SnippetExecutor => write!(f, "snippet-executor"),
            PluginType::HostingConnector => write!(f, "hosting-connector"),
            PluginType::Generic => write!(f, "generic"),
        }
    }
}

impl FromStr for PluginType {
    type Err = SfxError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        PluginType::ALL
            .into_iter()
            .find(|t| t.to_string() == wanted)
            .ok_or_else(|| SfxError::ManifestInvalid(format!("Unknown plugin type: {}", s.trim())))
    }
}

/// Dotted numeric plugin version
///
/// One to three numeric components are accepted and padded to `major.minor.patch`,
/// optionally followed by a semver pre-release (`-rc.1`) or build (`+abc`) suffix. The
/// ordering is the semver ordering of the padded value, so `1.0` and `1.0.0` compare
/// equal while their text differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginVersion {
    raw: String,
    normalized: semver::Version,
}

impl PluginVersion {
    /// The version as written in the manifest, trimmed
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &semver::Version {
        &self.normalized
    }

    /// Same text, not merely the same rank
    pub fn is_textually_equal(&self, other: &PluginVersion) -> bool {
        self.raw == other.raw
    }
}

impl FromStr for PluginVersion {
    type Err = SfxError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(SfxError::ManifestInvalid("Version is blank".to_string()));
        }

        let split = raw.find(|c| c == '-' || c == '+').unwrap_or(raw.len());
        let (core, suffix) = raw.split_at(split);

        let mut components = Vec::with_capacity(3);
        for component in core.split('.') {
            if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
                return Err(SfxError::ManifestInvalid(format!("Unparsable version: {}", raw)));
            }
            let value: u64 = component
                .parse()
                .map_err(|_| SfxError::ManifestInvalid(format!("Unparsable version: {}", raw)))?;
            components.push(value);
        }
        if components.len() > 3 {
            return Err(SfxError::ManifestInvalid(format!(
                "Version has more than three components: {}",
                raw
            )));
        }
        components.resize(3, 0);

        let normalized = format!("{}.{}.{}{}", components[0], components[1], components[2], suffix);
        let normalized = semver::Version::parse(&normalized)
            .map_err(|e| SfxError::ManifestInvalid(format!("Unparsable version {}: {}", raw, e)))?;

        Ok(Self {
            raw: raw.to_string(),
            normalized,
        })
    }
}

impl TryFrom<String> for PluginVersion {
    type Error = SfxError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PluginVersion> for String {
    fn from(version: PluginVersion) -> Self {
        version.raw
    }
}

impl std::fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for PluginVersion {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for PluginVersion {}

impl PartialOrd for PluginVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PluginVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Hash for PluginVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

/// Metadata declared in a plugin package manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: PluginVersion,
    #[serde(default)]
    pub description: String,
    pub plugin_type: PluginType,
    /// Class instantiated when the plugin starts
    #[serde(default)]
    pub activation_class: Option<String>,
    /// Icon hint for the setup wizard
    #[serde(default)]
    pub icon_name: Option<String>,
    /// Every attribute of the manifest, recognised or not
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl PluginManifest {
    /// Build and validate a manifest from raw attributes
    ///
    /// Name and version are required: missing, empty and all-whitespace values are
    /// rejected, never defaulted.
    pub fn from_attributes(attributes: BTreeMap<String, String>) -> Result<Self> {
        let name = required(&attributes, ATTR_NAME)?.to_string();
        let version: PluginVersion = required(&attributes, ATTR_VERSION)?.parse()?;

        let plugin_type = match optional(&attributes, ATTR_TYPE) {
            Some(value) => value.parse()?,
            None => PluginType::Generic,
        };

        Ok(Self {
            name,
            version,
            description: optional(&attributes, ATTR_DESCRIPTION).unwrap_or_default().to_string(),
            plugin_type,
            activation_class: optional(&attributes, ATTR_CLASS).map(str::to_string),
            icon_name: optional(&attributes, ATTR_ICON_NAME).map(str::to_string),
            attributes,
        })
    }

    /// `name@version`
    pub fn id(&self) -> PluginId {
        format!("{}@{}", self.name, self.version)
    }
}

fn optional<'a>(attributes: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    attributes
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn required<'a>(attributes: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str> {
    optional(attributes, key)
        .ok_or_else(|| SfxError::ManifestInvalid(format!("{} is missing or blank", key)))
}

/// Plugin state enumeration
///
/// ```text
/// Installed ──start──> Active ──stop/superseded──> Installed
///     │                  │
///     └──start fails──> Failed        any ──uninstall──> Uninstalled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Registered with the manager but not running
    Installed,

    /// Services instantiated and visible to queries
    Active,

    /// Instantiation failed; the class loader has been released
    Failed,

    /// Removed from the manager
    Uninstalled,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::Installed => write!(f, "installed"),
            PluginState::Active => write!(f, "active"),
            PluginState::Failed => write!(f, "failed"),
            PluginState::Uninstalled => write!(f, "uninstalled"),
        }
    }
}

/// Event published when a plugin's state changes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStateEvent {
    pub plugin_id: PluginId,
    pub plugin_name: String,
    pub version: String,
    /// Previous state (None when newly registered)
    pub old_state: Option<PluginState>,
    pub new_state: PluginState,
    pub timestamp: i64,
}
