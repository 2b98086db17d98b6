//! Fixture builders for plugin archives used across the test suites

use crate::plugin::archive::ARCHIVE_EXTENSION;
use crate::plugin::package::{CLASSES_DIR, ICON_PATH, MANIFEST_PATH, PACKAGE_EXTENSION, SERVICES_DIR};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Zip the given `(name, bytes)` entries in order
pub fn zip_entries(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, bytes) in entries {
        zip.start_file(name.as_str(), options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Builds the inner `.pkg` of a plugin
pub struct PackageBuilder {
    attributes: Vec<(String, String)>,
    manifest: bool,
    entries: Vec<(String, Vec<u8>)>,
}

impl PackageBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            attributes: vec![
                ("Plugin-Name".to_string(), name.to_string()),
                ("Plugin-Version".to_string(), version.to_string()),
            ],
            manifest: true,
            entries: Vec::new(),
        }
    }

    pub fn without_manifest() -> Self {
        Self {
            attributes: Vec::new(),
            manifest: false,
            entries: Vec::new(),
        }
    }

    pub fn attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.push((key.to_string(), value.to_string()));
        self
    }

    pub fn service(self, interface: &str, class: &str) -> Self {
        let path = format!("{}{}", SERVICES_DIR, interface);
        self.resource(&path, format!("{}\n", class).as_bytes())
    }

    pub fn class(self, name: &str, descriptor: &str) -> Self {
        let path = format!("{}{}.toml", CLASSES_DIR, name);
        self.resource(&path, descriptor.as_bytes())
    }

    pub fn icon(self, bytes: &[u8]) -> Self {
        self.resource(ICON_PATH, bytes)
    }

    pub fn resource(mut self, path: &str, bytes: &[u8]) -> Self {
        self.entries.push((path.to_string(), bytes.to_vec()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        if self.manifest {
            let mut text = String::from("Manifest-Version: 1.0\r\n");
            for (key, value) in &self.attributes {
                text.push_str(&format!("{}: {}\r\n", key, value));
            }
            entries.push((MANIFEST_PATH.to_string(), text.into_bytes()));
        }
        entries.extend(self.entries);
        zip_entries(&entries)
    }
}

/// Builds a `<stem>.sfx-plugin` container around a package
pub struct ArchiveBuilder {
    stem: String,
    package: Option<Vec<u8>>,
    extra: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new(stem: &str, package: PackageBuilder) -> Self {
        Self {
            stem: stem.to_string(),
            package: Some(package.build()),
            extra: Vec::new(),
        }
    }

    pub fn without_package(stem: &str) -> Self {
        Self {
            stem: stem.to_string(),
            package: None,
            extra: Vec::new(),
        }
    }

    /// Extra container entry, written verbatim, hostile names included
    pub fn entry(mut self, name: &str, bytes: &[u8]) -> Self {
        self.extra.push((name.to_string(), bytes.to_vec()));
        self
    }

    pub fn write_to(self, dir: &Path) -> PathBuf {
        let mut entries = Vec::new();
        if let Some(package) = self.package {
            entries.push((format!("{}.{}", self.stem, PACKAGE_EXTENSION), package));
        }
        entries.extend(self.extra);

        let path = dir.join(format!("{}.{}", self.stem, ARCHIVE_EXTENSION));
        std::fs::write(&path, zip_entries(&entries)).unwrap();
        path
    }
}

/// Markup plugin whose activation class implements `sfx.markup.Markup`
pub fn markup_package(name: &str, version: &str) -> PackageBuilder {
    PackageBuilder::new(name, version)
        .attribute("Plugin-Description", "This is a dummy plugin")
        .attribute("Plugin-Type", "markup")
        .service("sfx.markup.Markup", "com.acme.DummyMarkup")
        .class(
            "com.acme.DummyMarkup",
            "extends = \"sfx.plugin.AbstractPlugin\"\nimplements = [\"sfx.markup.Markup\"]\n\n[properties]\nsyntax = \"dummy\"\n",
        )
}

/// Write a valid markup plugin archive named `<stem>.sfx-plugin`
pub fn create_dummy_plugin(dir: &Path, stem: &str, name: &str, version: &str) -> PathBuf {
    ArchiveBuilder::new(stem, markup_package(name, version)).write_to(dir)
}
