//! Plugin archive
//!
//! A `.sfx-plugin` file on disk: a zip container wrapping the inner package plus any
//! files shipped beside it. The archive validates its metadata and unpacks itself into
//! a directory dedicated to its name and version.

use crate::core::error::{Result, SfxError};
use crate::plugin::package::{self, PluginPackage, ICON_PATH, PACKAGE_EXTENSION};
use crate::plugin::types::PluginManifest;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{OnceLock, RwLock};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Extension of plugin archive files
pub const ARCHIVE_EXTENSION: &str = "sfx-plugin";

/// Marker left in an unpacked directory, holding the sha256 of the source archive
pub const SOURCE_MARKER: &str = ".sfx-source";

/// Whether the archive has been extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackState {
    Archived,
    Unpacked,
}

/// Outcome of [`PluginArchive::unpack`]
#[derive(Debug)]
pub struct UnpackReport {
    pub dir: PathBuf,
    /// Entries written to disk
    pub extracted: usize,
    /// Entries refused because they would land outside `dir`
    pub rejected: Vec<SfxError>,
    /// The directory already matched the archive and was left untouched
    pub reused: bool,
}

#[derive(Debug)]
pub struct PluginArchive {
    file: PathBuf,
    name_only: String,
    manifest: OnceLock<PluginManifest>,
    unpacked: RwLock<Option<PathBuf>>,
}

impl PluginArchive {
    /// Wrap a plugin archive file
    ///
    /// The file is not read here; only its name is checked.
    pub fn new(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let name_only = file
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(&format!(".{}", ARCHIVE_EXTENSION)))
            .filter(|stem| !stem.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                SfxError::InvalidArgument(format!(
                    "{} is not a .{} file",
                    file.display(),
                    ARCHIVE_EXTENSION
                ))
            })?;

        Ok(Self {
            file,
            name_only,
            manifest: OnceLock::new(),
            unpacked: RwLock::new(None),
        })
    }

    /// Wrap and validate in one go
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let archive = Self::new(file)?;
        archive.metadata()?;
        Ok(archive)
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// File name without the archive extension
    pub fn name_only(&self) -> &str {
        &self.name_only
    }

    /// Name of the inner package entry
    pub fn package_entry_name(&self) -> String {
        format!("{}.{}", self.name_only, PACKAGE_EXTENSION)
    }

    /// Read the manifest of the inner package
    ///
    /// The package is taken from the unpacked directory when there is one, else straight
    /// from the container. Always reads; see [`PluginArchive::metadata`] for the cached
    /// value.
    pub fn parse_metadata(&self) -> Result<PluginManifest> {
        Ok(self.package()?.manifest().clone())
    }

    /// Manifest parsed on first use and kept for the life of the archive
    pub fn metadata(&self) -> Result<&PluginManifest> {
        if let Some(manifest) = self.manifest.get() {
            return Ok(manifest);
        }
        let manifest = self.parse_metadata()?;
        Ok(self.manifest.get_or_init(|| manifest))
    }

    /// Index of the inner package
    pub fn package(&self) -> Result<PluginPackage> {
        PluginPackage::from_bytes(self.package_bytes()?)
    }

    /// Icon bytes from `META-INF/icon.png`
    pub fn icon(&self) -> Result<Option<Vec<u8>>> {
        let mut zip = ZipArchive::new(std::io::Cursor::new(self.package_bytes()?))
            .map_err(|e| SfxError::ManifestInvalid(format!("Package is not a valid zip: {}", e)))?;
        package::read_entry(&mut zip, ICON_PATH)
    }

    /// Directory dedicated to this archive's name and version under `root`
    ///
    /// The readable slug is followed by a hash of the exact name, so names that slug
    /// alike never share a directory.
    pub fn unpack_dir(&self, root: &Path) -> Result<PathBuf> {
        let manifest = self.metadata()?;
        Ok(root.join(dir_name(&manifest.name, manifest.version.as_str())))
    }

    /// Path of the inner package once unpacked under `root`
    pub fn unpacked_package(&self, root: &Path) -> Result<PathBuf> {
        Ok(self.unpack_dir(root)?.join(self.package_entry_name()))
    }

    /// Unpacked under `root` and the marker written last is present
    pub fn is_unpacked(&self, root: &Path) -> bool {
        match self.unpack_dir(root) {
            Ok(dir) => dir.join(SOURCE_MARKER).is_file(),
            Err(_) => false,
        }
    }

    pub fn state(&self, root: &Path) -> UnpackState {
        if self.is_unpacked(root) {
            UnpackState::Unpacked
        } else {
            UnpackState::Archived
        }
    }

    /// Extract the container into [`PluginArchive::unpack_dir`]
    ///
    /// Entries that would resolve outside the directory are skipped and reported;
    /// extraction of the others carries on. A directory left by the very same archive is
    /// reused, a stale one is wiped first.
    pub fn unpack(&self, root: &Path) -> Result<UnpackReport> {
        let dir = self.unpack_dir(root)?;
        let digest = self.digest()?;
        let marker = dir.join(SOURCE_MARKER);

        if fs::read_to_string(&marker).map(|found| found.trim() == digest).unwrap_or(false) {
            debug!(archive = %self.file.display(), dir = %dir.display(), "Reusing unpacked plugin");
            self.set_unpacked(Some(dir.clone()));
            return Ok(UnpackReport {
                dir,
                extracted: 0,
                rejected: Vec::new(),
                reused: true,
            });
        }

        if dir.exists() {
            info!(dir = %dir.display(), "Removing stale unpacked plugin");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let file = fs::File::open(&self.file)?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| SfxError::ManifestInvalid(format!("{} is not a valid zip: {}", self.file.display(), e)))?;

        let mut extracted = 0;
        let mut rejected = Vec::new();

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let name = entry.name().to_string();

            let relative = match (entry_path(&name), entry.enclosed_name().is_some()) {
                (Ok(relative), true) => relative,
                (Err(reason), _) => {
                    warn!(archive = %self.file.display(), entry = %name, reason, "Rejected archive entry");
                    rejected.push(SfxError::ExtractionRejected(format!("{}: {}", name, reason)));
                    continue;
                }
                (Ok(_), false) => {
                    warn!(archive = %self.file.display(), entry = %name, "Rejected archive entry");
                    rejected.push(SfxError::ExtractionRejected(name));
                    continue;
                }
            };

            let outpath = dir.join(relative);
            if !outpath.starts_with(&dir) {
                rejected.push(SfxError::ExtractionRejected(name));
                continue;
            }

            if entry.is_dir() {
                fs::create_dir_all(&outpath)?;
            } else {
                if let Some(parent) = outpath.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut outfile = fs::File::create(&outpath)?;
                std::io::copy(&mut entry, &mut outfile)?;
                extracted += 1;
            }

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o777))?;
                }
            }
        }

        fs::write(&marker, &digest)?;
        self.set_unpacked(Some(dir.clone()));

        info!(
            archive = %self.file.display(),
            dir = %dir.display(),
            extracted,
            rejected = rejected.len(),
            "Plugin unpacked"
        );

        Ok(UnpackReport {
            dir,
            extracted,
            rejected,
            reused: false,
        })
    }

    /// Remove the unpacked directory; removing an absent one is fine
    pub fn cleanup(&self, root: &Path) -> Result<()> {
        let dir = self.unpack_dir(root)?;
        self.set_unpacked(None);

        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(dir = %dir.display(), "Unpacked plugin removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_unpacked(&self, dir: Option<PathBuf>) {
        if let Ok(mut unpacked) = self.unpacked.write() {
            *unpacked = dir;
        }
    }

    fn package_bytes(&self) -> Result<Vec<u8>> {
        let unpacked = self.unpacked.read().ok().and_then(|dir| dir.clone());
        if let Some(dir) = unpacked {
            let path = dir.join(self.package_entry_name());
            if path.is_file() {
                return Ok(fs::read(path)?);
            }
        }

        let file = fs::File::open(&self.file)?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| SfxError::ManifestInvalid(format!("{} is not a valid zip: {}", self.file.display(), e)))?;
        package::read_entry(&mut zip, &self.package_entry_name())?.ok_or_else(|| {
            SfxError::ManifestInvalid(format!(
                "{} does not contain {}",
                self.file.display(),
                self.package_entry_name()
            ))
        })
    }

    fn digest(&self) -> Result<String> {
        let mut file = fs::File::open(&self.file)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Relative path an entry extracts to, or why it may not be extracted
///
/// Both separators are honoured so a Windows-built archive cannot sneak `..\` past the
/// check.
fn entry_path(name: &str) -> std::result::Result<PathBuf, &'static str> {
    if name.contains('\0') {
        return Err("entry name contains NUL");
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return Err("absolute entry path");
    }

    let mut path = PathBuf::new();
    let mut depth = 0usize;
    for (index, component) in name.split(['/', '\\']).enumerate() {
        match component {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return Err("entry escapes the unpack directory");
                }
                depth -= 1;
                path.pop();
            }
            other => {
                if index == 0 && other.contains(':') {
                    return Err("entry path has a drive prefix");
                }
                depth += 1;
                path.push(other);
            }
        }
    }

    if depth == 0 {
        return Err("empty entry path");
    }
    Ok(path)
}

fn dir_name(name: &str, version: &str) -> String {
    let hash = format!("{:x}", Sha256::digest(name.as_bytes()));
    format!("{}-{}-{}", slug(name), &hash[..8], version)
}

fn slug(name: &str) -> String {
    static NON_ALNUM: OnceLock<Regex> = OnceLock::new();
    let re = NON_ALNUM.get_or_init(|| Regex::new(r"[^a-z0-9]+").unwrap());

    let lowered = name.to_lowercase();
    let slug = re.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "plugin".to_string()
    } else {
        slug.to_string()
    }
}
