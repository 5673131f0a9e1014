//! Document sources the index is built from.
//!
//! A [`DocumentSource`] lists what it has (key, modification time, size)
//! and fetches raw bytes by key. The updater diffs listings against its
//! state, so listing must be cheap and must not read file contents.
//!
//! | Config | Source |
//! |--------|--------|
//! | `[source.filesystem]` | [`FsSource`]: a local directory walked with glob filters |
//! | `[source.s3]` | [`crate::source_s3::S3Source`]: an S3 or S3-compatible bucket |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::{FilesystemSourceConfig, SourceConfig};
use crate::source_s3::S3Source;

/// One entry of a source listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceListing {
    pub key: String,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub size_bytes: u64,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn name(&self) -> &str;

    /// All current documents, sorted by key.
    async fn list(&self) -> Result<Vec<SourceListing>>;

    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// Build the source described by `[source]`.
pub fn create_source(config: &SourceConfig) -> Result<Arc<dyn DocumentSource>> {
    match (&config.filesystem, &config.s3) {
        (Some(fs), None) => Ok(Arc::new(FsSource::new(fs)?)),
        (None, Some(s3)) => Ok(Arc::new(S3Source::new(s3.clone())?)),
        (None, None) => bail!("No document source configured: add [source.filesystem] or [source.s3]"),
        (Some(_), Some(_)) => bail!("Configure only one of [source.filesystem] and [source.s3]"),
    }
}

/// Build a [`GlobSet`] from a list of glob pattern strings.
pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

// ============ Filesystem ============

/// A local directory tree.
///
/// Keys are paths relative to the root with `/` separators. `.git`,
/// `target`, and `node_modules` directories are always excluded.
pub struct FsSource {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FsSource {
    pub fn new(config: &FilesystemSourceConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            bail!("refusing to read outside the source root: {}", key);
        }
        Ok(self.root.join(relative))
    }

    fn scan(&self) -> Result<Vec<SourceListing>> {
        if !self.root.exists() {
            bail!("Filesystem source root does not exist: {}", self.root.display());
        }

        let mut listings = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.exclude.is_match(&key) || !self.include.is_match(&key) {
                continue;
            }

            let metadata = entry.metadata()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let last_modified = modified
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64;

            listings.push(SourceListing {
                key,
                last_modified,
                size_bytes: metadata.len(),
            });
        }

        listings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listings)
    }
}

#[async_trait]
impl DocumentSource for FsSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn list(&self) -> Result<Vec<SourceListing>> {
        self.scan()
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fs_source(root: &Path, include: &[&str]) -> FsSource {
        FsSource::new(&FilesystemSourceConfig {
            root: root.to_path_buf(),
            include_globs: include.iter().map(|s| s.to_string()).collect(),
            exclude_globs: vec!["**/drafts/**".to_string()],
            follow_symlinks: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("recipes/drafts")).unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join("recipes/mojito.txt"), "mint").unwrap();
        std::fs::write(tmp.path().join("recipes/drafts/wip.txt"), "wip").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "bb").unwrap();
        std::fs::write(tmp.path().join("image.png"), [0u8, 1]).unwrap();
        std::fs::write(tmp.path().join(".git/config.txt"), "x").unwrap();

        let source = fs_source(tmp.path(), &["**/*.txt"]);
        let keys: Vec<String> = source.list().await.unwrap().into_iter().map(|l| l.key).collect();
        assert_eq!(keys, vec!["b.txt", "recipes/mojito.txt"]);
    }

    #[tokio::test]
    async fn test_fetch_reads_bytes() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "tequila").unwrap();
        let source = fs_source(tmp.path(), &["**/*.txt"]);
        let listing = source.list().await.unwrap();
        assert_eq!(listing[0].size_bytes, 7);
        assert!(listing[0].last_modified > 0);
        assert_eq!(source.fetch("a.txt").await.unwrap(), b"tequila");
    }

    #[tokio::test]
    async fn test_fetch_rejects_escape() {
        let tmp = TempDir::new().unwrap();
        let source = fs_source(tmp.path(), &["**/*"]);
        assert!(source.fetch("../secret.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_root_is_error() {
        let tmp = TempDir::new().unwrap();
        let source = fs_source(&tmp.path().join("nope"), &["**/*"]);
        assert!(source.list().await.is_err());
    }

    #[test]
    fn test_create_source_requires_one() {
        assert!(create_source(&SourceConfig::default()).is_err());
    }
}
