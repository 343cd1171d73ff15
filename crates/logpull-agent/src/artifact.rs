//! Artifact production on the agent.
//!
//! The protocol only needs a file of known length. [`LogBundle`] produces one
//! by archiving the configured log directories into a zstd-compressed tar.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// File name of the staged archive.
pub const ARCHIVE_NAME: &str = "logs.tar.zst";

/// zstd level for the archive (fast with good compression)
const COMPRESSION_LEVEL: i32 = 3;

/// A built artifact ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub len: u64,
}

/// Produces the blob an agent ships to the hub.
///
/// `build` may be called repeatedly and must replace any previous artifact.
/// Both methods block and are run off the async executor.
pub trait ArtifactSource: Send + Sync + 'static {
    /// Build or refresh the artifact.
    fn build(&self) -> io::Result<Artifact>;

    /// Remove the artifact and its staging area after a successful send.
    fn cleanup(&self) -> io::Result<()>;
}

/// Archives log and configuration directories into one compressed file.
#[derive(Debug, Clone)]
pub struct LogBundle {
    sources: Vec<PathBuf>,
    staging_dir: PathBuf,
}

impl LogBundle {
    pub fn new(sources: Vec<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            staging_dir: staging_dir.into(),
        }
    }

    /// Path the archive is written to.
    pub fn archive_path(&self) -> PathBuf {
        self.staging_dir.join(ARCHIVE_NAME)
    }
}

/// Top-level name of a source directory inside the archive, unique per bundle.
fn entry_name(dir: &Path, index: usize, taken: &mut HashSet<String>) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("source-{}", index));

    if taken.insert(base.clone()) {
        return base;
    }
    let unique = format!("{}-{}", base, index);
    taken.insert(unique.clone());
    unique
}

impl ArtifactSource for LogBundle {
    fn build(&self) -> io::Result<Artifact> {
        fs::create_dir_all(&self.staging_dir)?;

        let path = self.archive_path();
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let encoder = zstd::stream::write::Encoder::new(File::create(&path)?, COMPRESSION_LEVEL)?;
        let mut builder = tar::Builder::new(encoder);
        let mut taken = HashSet::new();

        for (index, dir) in self.sources.iter().enumerate() {
            if !dir.is_dir() {
                tracing::warn!("Log source {:?} not found, skipping", dir);
                continue;
            }
            let name = entry_name(dir, index, &mut taken);
            builder.append_dir_all(&name, dir)?;
            tracing::debug!("Bundled {:?} as {}", dir, name);
        }

        let file = builder.into_inner()?.finish()?;
        file.sync_all()?;
        drop(file);

        let len = fs::metadata(&path)?.len();
        tracing::info!("Log bundle created at {:?} ({} bytes)", path, len);

        Ok(Artifact { path, len })
    }

    fn cleanup(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_entries(path: &Path) -> Vec<String> {
        let decoder = zstd::stream::read::Decoder::new(File::open(path).unwrap()).unwrap();
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_bundle_contains_every_source() {
        let root = tempfile::tempdir().unwrap();
        let logs = root.path().join("log");
        let conf = root.path().join("conf");
        fs::create_dir_all(logs.join("archive")).unwrap();
        fs::create_dir_all(&conf).unwrap();
        fs::write(logs.join("agent.log"), "line one\nline two\n").unwrap();
        fs::write(logs.join("archive").join("old.log"), "older").unwrap();
        fs::write(conf.join("agent.json"), "{}").unwrap();

        let bundle = LogBundle::new(vec![logs, conf], root.path().join("staging"));
        let artifact = bundle.build().unwrap();

        assert_eq!(artifact.len, fs::metadata(&artifact.path).unwrap().len());
        let entries = archive_entries(&artifact.path);
        assert!(entries.iter().any(|e| e == "log/agent.log"));
        assert!(entries.iter().any(|e| e == "log/archive/old.log"));
        assert!(entries.iter().any(|e| e == "conf/agent.json"));
    }

    #[test]
    fn test_missing_sources_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let bundle = LogBundle::new(vec![root.path().join("nope")], root.path().join("staging"));

        let artifact = bundle.build().unwrap();
        assert!(artifact.path.exists());
        assert!(archive_entries(&artifact.path).is_empty());
    }

    #[test]
    fn test_rebuild_replaces_and_cleanup_removes() {
        let root = tempfile::tempdir().unwrap();
        let logs = root.path().join("log");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("a.log"), "a").unwrap();

        let staging = root.path().join("staging");
        let bundle = LogBundle::new(vec![logs.clone()], &staging);
        bundle.build().unwrap();

        fs::write(logs.join("b.log"), "b").unwrap();
        let artifact = bundle.build().unwrap();
        assert_eq!(archive_entries(&artifact.path).len(), 3);

        bundle.cleanup().unwrap();
        assert!(!staging.exists());
        bundle.cleanup().unwrap();
    }

    #[test]
    fn test_entry_names_are_unique() {
        let mut taken = HashSet::new();
        assert_eq!(entry_name(Path::new("/a/log"), 0, &mut taken), "log");
        assert_eq!(entry_name(Path::new("/b/log"), 1, &mut taken), "log-1");
        assert_eq!(entry_name(Path::new("/"), 2, &mut taken), "source-2");
    }
}
