//! Source bundles built from the instance template.
//!
//! Every regular file under the template root is rendered as a template
//! with the instance variables and packed into a gzip-compressed tar
//! archive. Files that are not valid UTF-8 are packed verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use minijinja::{Environment, UndefinedBehavior};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Template variable: instance ID.
pub const VAR_INSTANCE_ID: &str = "INSTANCE_ID";
/// Template variable: Building-phase instance name.
pub const VAR_INSTANCE_NAME: &str = "INSTANCE_NAME";
/// Template variable: release version.
pub const VAR_VERSION: &str = "VERSION";
/// Template variable: instance name prefix.
pub const VAR_NAME_PREFIX: &str = "NAME_PREFIX";

/// Errors from bundle building.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("template walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("template root {0} is not a directory")]
    MissingRoot(PathBuf),

    #[error("failed to render {path}: {source}")]
    Render {
        path: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("bundle task failed: {0}")]
    Join(String),
}

/// A packed source archive.
#[derive(Debug, Clone)]
pub struct SourceBundle {
    /// Gzip-compressed tar bytes.
    pub bytes: Bytes,

    /// `SHA256:<hex>` digest of `bytes`.
    pub checksum: String,

    /// Number of files packed.
    pub files: usize,
}

/// Build a bundle from the template at `root`.
///
/// Entries are walked in sorted order and named relative to `root` with
/// forward slashes. Directories are packed with their modes so empty ones
/// survive. Symlinks and special files are skipped.
pub fn build_bundle(root: &Path, vars: &BTreeMap<String, String>) -> Result<SourceBundle, BundleError> {
    if !root.is_dir() {
        return Err(BundleError::MissingRoot(root.to_path_buf()));
    }

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    let mut files = 0;

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if entry.depth() > 0 {
                let relative = archive_path(root, entry.path());
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(file_mode(&entry.metadata()?));
                header.set_mtime(0);
                archive.append_data(&mut header, format!("{relative}/"), io::empty())?;
            }
            continue;
        }
        if !file_type.is_file() {
            warn!(path = %entry.path().display(), "Skipping non-regular template entry");
            continue;
        }

        let relative = archive_path(root, entry.path());
        let raw = fs::read(entry.path())?;
        let contents = match String::from_utf8(raw) {
            Ok(text) => env
                .render_str(&text, vars)
                .map_err(|source| BundleError::Render {
                    path: relative.clone(),
                    source,
                })?
                .into_bytes(),
            Err(not_utf8) => not_utf8.into_bytes(),
        };

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(file_mode(&entry.metadata()?));
        header.set_mtime(0);
        archive.append_data(&mut header, &relative, contents.as_slice())?;

        debug!(path = %relative, size = contents.len(), "Packed template file");
        files += 1;
    }

    let bytes = archive.into_inner()?.finish()?;
    let checksum = format!("SHA256:{}", hex::encode(Sha256::digest(&bytes)));

    Ok(SourceBundle {
        bytes: Bytes::from(bytes),
        checksum,
        files,
    })
}

/// Build a bundle on the blocking thread pool.
pub async fn build_bundle_blocking(
    root: PathBuf,
    vars: BTreeMap<String, String>,
) -> Result<SourceBundle, BundleError> {
    tokio::task::spawn_blocking(move || build_bundle(&root, &vars))
        .await
        .map_err(|e| BundleError::Join(e.to_string()))?
}

fn archive_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            (VAR_INSTANCE_ID.to_string(), "01hv4z2wqxkjnm8gpqy6vbkc3d".to_string()),
            (
                VAR_INSTANCE_NAME.to_string(),
                "cf-01hv4z2wqxkjnm8gpqy6vbkc3d-001b".to_string(),
            ),
            (VAR_VERSION.to_string(), "0.0.1".to_string()),
            (VAR_NAME_PREFIX.to_string(), "cf".to_string()),
        ])
    }

    /// Regular files in the bundle with their contents.
    fn unpack(bundle: &SourceBundle) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bundle.bytes.as_ref()));
        archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.header().entry_type().is_file())
            .map(|mut entry| {
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    /// Every entry in the bundle as (path, is_dir, mode).
    fn listing(bundle: &SourceBundle) -> Vec<(String, bool, u32)> {
        let mut archive = tar::Archive::new(GzDecoder::new(bundle.bytes.as_ref()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
                let header = entry.header();
                (path, header.entry_type().is_dir(), header.mode().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_renders_variables_and_keeps_newline() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("Procfile"),
            "web: serve --name {{ INSTANCE_NAME }} --version {{ VERSION }}\n",
        )
        .unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();
        let entries = unpack(&bundle);

        assert_eq!(bundle.files, 1);
        assert_eq!(entries[0].0, "Procfile");
        assert_eq!(
            String::from_utf8(entries[0].1.clone()).unwrap(),
            "web: serve --name cf-01hv4z2wqxkjnm8gpqy6vbkc3d-001b --version 0.0.1\n"
        );
    }

    #[test]
    fn test_nested_paths_are_sorted_and_relative() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config/nested")).unwrap();
        fs::write(dir.path().join("z.txt"), "z").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("config/nested/app.toml"), "id = \"{{ INSTANCE_ID }}\"").unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();
        let paths: Vec<String> = unpack(&bundle).into_iter().map(|(p, _)| p).collect();

        assert_eq!(paths, vec!["a.txt", "config/nested/app.toml", "z.txt"]);
    }

    #[test]
    fn test_directories_are_packed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("data/empty")).unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/start"), "#!/bin/sh\n").unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();
        let entries: Vec<(String, bool)> = listing(&bundle)
            .into_iter()
            .map(|(path, is_dir, _)| (path, is_dir))
            .collect();

        assert_eq!(
            entries,
            vec![
                ("bin".to_string(), true),
                ("bin/start".to_string(), false),
                ("data".to_string(), true),
                ("data/empty".to_string(), true),
            ]
        );
        assert_eq!(bundle.files, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_mode_is_kept() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let private = dir.path().join("private");
        fs::create_dir(&private).unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o700)).unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();

        assert_eq!(listing(&bundle), vec![("private".to_string(), true, 0o700)]);
    }

    #[test]
    fn test_binary_files_are_verbatim() {
        let dir = TempDir::new().unwrap();
        let binary = vec![0xff, 0xfe, b'{', b'{', 0x00, 0x80];
        fs::write(dir.path().join("logo.bin"), &binary).unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();
        assert_eq!(unpack(&bundle)[0].1, binary);
    }

    #[test]
    fn test_undefined_variable_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.json"), "{{ MISSING }}").unwrap();

        let err = build_bundle(dir.path(), &vars()).unwrap_err();
        assert!(matches!(err, BundleError::Render { ref path, .. } if path == "app.json"));
    }

    #[test]
    fn test_checksum_is_prefixed_sha256() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README"), "hello").unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();
        let hex_part = bundle.checksum.strip_prefix("SHA256:").unwrap();

        assert_eq!(hex_part.len(), 64);
        assert_eq!(hex_part, hex::encode(Sha256::digest(&bundle.bytes)));
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            build_bundle(&missing, &vars()),
            Err(BundleError::MissingRoot(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt")).unwrap();

        let bundle = build_bundle(dir.path(), &vars()).unwrap();
        let paths: Vec<String> = unpack(&bundle).into_iter().map(|(p, _)| p).collect();

        assert_eq!(paths, vec!["real.txt"]);
    }

    #[tokio::test]
    async fn test_blocking_variant() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>{{ NAME_PREFIX }}</h1>").unwrap();

        let bundle = build_bundle_blocking(dir.path().to_path_buf(), vars())
            .await
            .unwrap();
        assert_eq!(unpack(&bundle)[0].1, b"<h1>cf</h1>");
    }
}
