/*!
 * Worker update packages: a gzipped tarball of the source tree.
 */

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::debug;
use walkdir::{DirEntry, WalkDir};

use crate::errors::TranslationError;

/// Directory and file names never packaged
pub const EXCLUDED_NAMES: &[&str] = &[".git", "build", "target", "node_modules", ".DS_Store"];

/// `translator-update-{version}-{unix}.tar.gz`
pub fn package_name(version: &str, timestamp: i64) -> String {
    format!("translator-update-{}-{}.tar.gz", version, timestamp)
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| EXCLUDED_NAMES.contains(&name))
}

/// Archive `source_dir` into `output_dir` and return the package path
pub fn create_package(
    source_dir: &Path,
    output_dir: &Path,
    version: &str,
) -> Result<PathBuf, TranslationError> {
    if !source_dir.is_dir() {
        return Err(TranslationError::UpdateFailed(format!(
            "source directory {} does not exist",
            source_dir.display()
        )));
    }
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(package_name(version, chrono::Utc::now().timestamp()));

    let encoder = GzEncoder::new(File::create(&path)?, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    let mut files = 0usize;
    let walker = WalkDir::new(source_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded(e));
    for entry in walker {
        let entry = entry.map_err(|e| TranslationError::Io(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        // Never archive the package into itself
        if entry.path() == path {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| TranslationError::Io(e.to_string()))?;
        archive.append_path_with_name(entry.path(), relative)?;
        files += 1;
    }

    archive.into_inner()?.finish()?;
    debug!("Packaged {} files into {}", files, path.display());
    Ok(path)
}

/// Relative paths stored in a package
pub fn list_package(package: &Path) -> Result<Vec<String>, TranslationError> {
    let decoder = flate2::read::GzDecoder::new(File::open(package)?);
    let mut archive = tar::Archive::new(decoder);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        names.push(entry.path()?.to_string_lossy().into_owned());
    }
    Ok(names)
}
