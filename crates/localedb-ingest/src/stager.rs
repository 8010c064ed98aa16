//! Scratch-workspace staging of fetched artifacts
//!
//! One scratch directory is reused for every entity. It is cleared before an
//! entity is staged and again after its load finishes, so the stager and
//! loader of one entity must complete before the next entity is staged.
//!
//! Supported artifacts:
//!
//! - **Zip** (.zip)
//! - **Tar.gz** (.tar.gz, .tgz)
//! - **Tar** (.tar)
//! - **Gzip** (.gz): a single file, decompressed to its stem
//! - anything else is copied verbatim

use flate2::read::GzDecoder;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Zip,
    TarGz,
    Tar,
    Gzip,
    Plain,
}

impl ArtifactKind {
    fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".zip") {
            ArtifactKind::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArtifactKind::TarGz
        } else if name.ends_with(".tar") {
            ArtifactKind::Tar
        } else if name.ends_with(".gz") {
            ArtifactKind::Gzip
        } else {
            ArtifactKind::Plain
        }
    }
}

/// Unpacks artifacts into the shared scratch workspace
#[derive(Debug, Clone)]
pub struct Stager {
    scratch: PathBuf,
}

impl Stager {
    pub fn new(scratch: impl Into<PathBuf>) -> Self {
        Self {
            scratch: scratch.into(),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.scratch
    }

    /// Empty the workspace, creating it when missing
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.scratch).await {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.scratch).await?;
        Ok(())
    }

    /// Clear the workspace and unpack `artifact` into it
    pub async fn stage(&self, artifact: &Path) -> Result<PathBuf> {
        self.clear().await?;

        let kind = ArtifactKind::detect(artifact);
        let src = artifact.to_path_buf();
        let dst = self.scratch.clone();
        let label = artifact.display().to_string();

        let files = tokio::task::spawn_blocking(move || unpack(kind, &src, &dst))
            .await
            .map_err(|e| IngestError::Internal(format!("staging task failed: {}", e)))?
            .map_err(|e| IngestError::stage(&label, e))?;

        debug!(artifact = %label, kind = ?kind, files, "Staged");
        Ok(self.scratch.clone())
    }
}

fn unpack(kind: ArtifactKind, src: &Path, dst: &Path) -> io::Result<usize> {
    match kind {
        ArtifactKind::Zip => unpack_zip(src, dst),
        ArtifactKind::TarGz => unpack_tar(GzDecoder::new(File::open(src)?), dst),
        ArtifactKind::Tar => unpack_tar(File::open(src)?, dst),
        ArtifactKind::Gzip => {
            let stem = src
                .file_stem()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?;
            let mut decoder = GzDecoder::new(File::open(src)?);
            let mut out = File::create(dst.join(stem))?;
            io::copy(&mut decoder, &mut out)?;
            Ok(1)
        },
        ArtifactKind::Plain => {
            let name = src
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no file name"))?;
            std::fs::copy(src, dst.join(name))?;
            Ok(1)
        },
    }
}

fn unpack_zip(src: &Path, dst: &Path) -> io::Result<usize> {
    let mut archive = zip::ZipArchive::new(File::open(src)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut files = 0;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let relative = entry.enclosed_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry escapes the workspace: {}", entry.name()),
            )
        })?;
        let target = dst.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        files += 1;
    }

    Ok(files)
}

fn unpack_tar<R: io::Read>(reader: R, dst: &Path) -> io::Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut files = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.display().to_string();
        if !entry.unpack_in(dst)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry escapes the workspace: {}", name),
            ));
        }
        if entry.header().entry_type().is_file() {
            files += 1;
        }
    }

    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_stage_zip_with_directories() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("ak.zip");
        write_zip(&archive, &[("ak/02020/people.txt", "id\n1\n"), ("readme.txt", "x")]);

        let stager = Stager::new(dir.path().join("scratch"));
        let ws = stager.stage(&archive).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(ws.join("ak/02020/people.txt")).unwrap(),
            "id\n1\n"
        );
        assert!(ws.join("readme.txt").exists());
    }

    #[tokio::test]
    async fn test_stage_clears_previous_entity() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first.csv");
        let second = dir.path().join("second.csv");
        std::fs::write(&first, "a").unwrap();
        std::fs::write(&second, "b").unwrap();

        let stager = Stager::new(dir.path().join("scratch"));
        stager.stage(&first).await.unwrap();
        let ws = stager.stage(&second).await.unwrap();
        assert!(!ws.join("first.csv").exists());
        assert!(ws.join("second.csv").exists());
    }

    #[tokio::test]
    async fn test_stage_gzip_to_stem() {
        let dir = TempDir::new().unwrap();
        let gz = dir.path().join("feed.csv.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(b"fips,date\n").unwrap();
        enc.finish().unwrap();

        let stager = Stager::new(dir.path().join("scratch"));
        let ws = stager.stage(&gz).await.unwrap();
        assert_eq!(std::fs::read_to_string(ws.join("feed.csv")).unwrap(), "fips,date\n");
    }

    #[tokio::test]
    async fn test_stage_rejects_escaping_zip_entry() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../outside.txt", "x")]);

        let stager = Stager::new(dir.path().join("scratch"));
        let err = stager.stage(&archive).await.unwrap_err();
        assert!(matches!(err, IngestError::Stage { .. }));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_detect_kind() {
        assert_eq!(ArtifactKind::detect(Path::new("a.TAR.GZ")), ArtifactKind::TarGz);
        assert_eq!(ArtifactKind::detect(Path::new("a.tgz")), ArtifactKind::TarGz);
        assert_eq!(ArtifactKind::detect(Path::new("a.zip")), ArtifactKind::Zip);
        assert_eq!(ArtifactKind::detect(Path::new("rows.csv")), ArtifactKind::Plain);
    }
}
