//! Inner plugin package
//!
//! A plugin archive wraps one package, itself a zip, laid out as:
//!
//! ```text
//! META-INF/MANIFEST.MF                 Key: Value attributes
//! META-INF/services/<interface>        implementing class name
//! META-INF/icon.png                    optional icon
//! classes/<class>.toml                 class descriptors
//! anything else                        resources
//! ```

use crate::core::error::{Result, SfxError};
use crate::plugin::types::{PluginManifest, PLUGIN_INTERFACE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Seek};
use zip::ZipArchive;

/// Extension of the package file inside an archive
pub const PACKAGE_EXTENSION: &str = "pkg";
pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const SERVICES_DIR: &str = "META-INF/services/";
pub const ICON_PATH: &str = "META-INF/icon.png";
pub const CLASSES_DIR: &str = "classes/";
const CLASS_DESCRIPTOR_EXTENSION: &str = ".toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassKind {
    #[default]
    Class,
    Interface,
}

/// Declaration of a class packaged in a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    /// Fully qualified name; the descriptor file stem when omitted
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: ClassKind,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub implements: Vec<String>,
    /// Native library inside the package backing this class
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ClassDescriptor {
    pub fn parse(file_stem: &str, text: &str) -> Result<Self> {
        let mut descriptor: ClassDescriptor = toml::from_str(text).map_err(|e| {
            SfxError::SerializationError(format!("Invalid class descriptor {}: {}", file_stem, e))
        })?;
        if descriptor.name.trim().is_empty() {
            descriptor.name = file_stem.to_string();
        }
        descriptor.name = descriptor.name.trim().to_string();
        Ok(descriptor)
    }

    /// Names this class directly extends or implements
    pub fn supertypes(&self) -> impl Iterator<Item = &str> {
        self.extends
            .iter()
            .map(String::as_str)
            .chain(self.implements.iter().map(String::as_str))
    }
}

/// Parse `MANIFEST.MF` text
///
/// Lines are `Key: Value`; a line starting with a single space continues the value of
/// the previous line. The first occurrence of a key wins.
pub fn parse_manifest(text: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(continuation) = line.strip_prefix(' ') {
            if let Some((_, value)) = current.as_mut() {
                value.push_str(continuation);
            }
            continue;
        }

        if let Some((key, value)) = current.take() {
            attributes.entry(key).or_insert(value);
        }

        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                current = Some((key.to_string(), value.trim_start().to_string()));
            }
        }
    }

    if let Some((key, value)) = current {
        attributes.entry(key).or_insert(value);
    }

    attributes
}

/// Index of a package: manifest, services directory, class descriptors, entry names
#[derive(Debug, Clone)]
pub struct PluginPackage {
    manifest: PluginManifest,
    services: BTreeMap<String, String>,
    classes: BTreeMap<String, ClassDescriptor>,
    entries: Vec<String>,
}

impl PluginPackage {
    /// Index an open package
    ///
    /// A missing or invalid manifest yields [`SfxError::ManifestInvalid`].
    pub fn read<R: Read + Seek>(zip: &mut ZipArchive<R>) -> Result<Self> {
        let manifest_bytes = read_entry(zip, MANIFEST_PATH)?
            .ok_or_else(|| SfxError::ManifestInvalid(format!("{} not found in package", MANIFEST_PATH)))?;
        let manifest_text = String::from_utf8(manifest_bytes)
            .map_err(|_| SfxError::ManifestInvalid("Manifest is not valid UTF-8".to_string()))?;
        let manifest = PluginManifest::from_attributes(parse_manifest(&manifest_text))?;

        let entries: Vec<String> = zip.file_names().map(str::to_string).collect();
        let mut services = BTreeMap::new();
        let mut classes = BTreeMap::new();

        for name in &entries {
            if let Some(interface) = name.strip_prefix(SERVICES_DIR) {
                if interface.is_empty() || interface.contains('/') {
                    continue;
                }
                let text = read_text(zip, name)?;
                match text.lines().map(str::trim).find(|line| !line.is_empty()) {
                    Some(class) => {
                        services.insert(interface.to_string(), class.to_string());
                    }
                    None => {
                        tracing::warn!(interface = interface, "Empty services file ignored");
                    }
                }
            } else if let Some(file) = name.strip_prefix(CLASSES_DIR) {
                if let Some(stem) = file.strip_suffix(CLASS_DESCRIPTOR_EXTENSION) {
                    let descriptor = ClassDescriptor::parse(stem, &read_text(zip, name)?)?;
                    classes.insert(descriptor.name.clone(), descriptor);
                }
            }
        }

        Ok(Self {
            manifest,
            services,
            classes,
            entries,
        })
    }

    /// Index a package held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let mut zip = ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| SfxError::ManifestInvalid(format!("Package is not a valid zip: {}", e)))?;
        Self::read(&mut zip)
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Interface name to implementing class name
    pub fn services(&self) -> &BTreeMap<String, String> {
        &self.services
    }

    pub fn classes(&self) -> &BTreeMap<String, ClassDescriptor> {
        &self.classes
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry == name)
    }

    /// Class instantiated on start
    ///
    /// `Plugin-Class` when declared, otherwise the service registered for the base
    /// plugin interface, otherwise the first services file.
    pub fn activation_class(&self) -> Option<&str> {
        self.manifest
            .activation_class
            .as_deref()
            .or_else(|| self.services.get(PLUGIN_INTERFACE).map(String::as_str))
            .or_else(|| self.services.values().next().map(String::as_str))
    }
}

/// Read one entry, `None` when absent
pub fn read_entry<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<u8>>> {
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if entry.is_dir() {
        return Ok(None);
    }

    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(Some(bytes))
}

fn read_text<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<String> {
    let bytes = read_entry(zip, name)?.unwrap_or_default();
    String::from_utf8(bytes).map_err(|_| SfxError::SerializationError(format!("{} is not valid UTF-8", name)))
}
