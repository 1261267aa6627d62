//! Band extraction from downloaded scene archives.
//!
//! Members are written through a `.part` file so an interrupted or corrupt
//! member never lands under its final name.

use crate::report::StatusReporter;
use crate::types::{FinderError, FinderResult};
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const PARTIAL_SUFFIX: &str = ".part";

/// Archive containers the extractor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Plain tar, the format of Landsat Collection 2 bundles
    Tar,
    /// Gzip-compressed tar
    TarGz,
    Zip,
}

impl ArchiveKind {
    /// Recognize an archive by file name; `None` for anything else
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

/// Result of one extraction attempt; never an `Err`
#[derive(Debug)]
pub enum ExtractionOutcome {
    /// File is not a recognized archive, nothing was done
    NotAnArchive,
    Extracted {
        written: Vec<PathBuf>,
        /// Members already present at their destination
        skipped: usize,
    },
    /// Corrupt or unreadable payload; the archive is left in place
    Failed(FinderError),
}

impl ExtractionOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ExtractionOutcome::Failed(_))
    }
}

fn band_member_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_B[0-9A-Za-z]").expect("valid band member pattern"))
}

/// True for `*.tif` members carrying a band marker (`_B4`, `_B10`, ...)
pub fn is_band_member(name: &str) -> bool {
    let path = Path::new(name);
    let is_tif = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("tif"))
        .unwrap_or(false);
    is_tif && band_member_regex().is_match(name)
}

/// Extracts band rasters from downloaded archives into the archive's directory
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    delete_archive: bool,
    reporter: StatusReporter,
}

impl ArchiveExtractor {
    pub fn new(delete_archive: bool) -> Self {
        Self {
            delete_archive,
            reporter: StatusReporter::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: StatusReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Extract matching band members next to `archive`.
    ///
    /// Idempotent: members that already exist are left untouched.
    pub fn extract(&self, archive: &Path) -> ExtractionOutcome {
        let kind = match ArchiveKind::from_path(archive) {
            Some(kind) => kind,
            None => return ExtractionOutcome::NotAnArchive,
        };

        let dest = archive
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        self.reporter.info("extracting files...");
        let result = match kind {
            ArchiveKind::Tar => File::open(archive)
                .map_err(FinderError::from)
                .and_then(|file| self.extract_tar(file, &dest)),
            ArchiveKind::TarGz => File::open(archive)
                .map_err(FinderError::from)
                .and_then(|file| self.extract_tar(flate2::read::GzDecoder::new(file), &dest)),
            ArchiveKind::Zip => self.extract_zip(archive, &dest),
        };

        match result {
            Ok((written, skipped)) => {
                if self.delete_archive {
                    if let Err(e) = std::fs::remove_file(archive) {
                        self.reporter.warn(&format!(
                            "could not remove archive {}: {}",
                            archive.display(),
                            e
                        ));
                    }
                }
                ExtractionOutcome::Extracted { written, skipped }
            }
            Err(e) => {
                let error = FinderError::Archive {
                    path: archive.to_path_buf(),
                    reason: e.to_string(),
                };
                self.reporter
                    .warn(&format!("not a valid archive: {}", archive.display()));
                ExtractionOutcome::Failed(error)
            }
        }
    }

    fn extract_tar<R: Read>(&self, reader: R, dest: &Path) -> FinderResult<(Vec<PathBuf>, usize)> {
        let mut archive = tar::Archive::new(reader);
        let mut written = Vec::new();
        let mut skipped = 0;

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let target = match self.member_target(&name, dest) {
                Some(target) => target,
                None => continue,
            };
            if target.exists() {
                skipped += 1;
                continue;
            }

            self.reporter.info(&format!(" {}", name));
            write_member(&target, |partial| {
                entry.unpack(partial)?;
                Ok(())
            })?;
            written.push(target);
        }

        Ok((written, skipped))
    }

    fn extract_zip(&self, archive: &Path, dest: &Path) -> FinderResult<(Vec<PathBuf>, usize)> {
        let file = File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| FinderError::Processing(format!("Failed to open ZIP: {}", e)))?;
        let mut written = Vec::new();
        let mut skipped = 0;

        for i in 0..zip.len() {
            let mut member = zip
                .by_index(i)
                .map_err(|e| FinderError::Processing(format!("Failed to read ZIP entry {}: {}", i, e)))?;
            if !member.is_file() {
                continue;
            }
            let name = member.name().to_string();
            let target = match self.member_target(&name, dest) {
                Some(target) => target,
                None => continue,
            };
            if target.exists() {
                skipped += 1;
                continue;
            }

            self.reporter.info(&format!(" {}", name));
            write_member(&target, |partial| {
                let mut out = File::create(partial)?;
                std::io::copy(&mut member, &mut out)?;
                out.sync_all()?;
                Ok(())
            })?;
            written.push(target);
        }

        Ok((written, skipped))
    }

    /// Destination for a band member, flattened to its file name
    fn member_target(&self, name: &str, dest: &Path) -> Option<PathBuf> {
        if !is_band_member(name) {
            return None;
        }
        Path::new(name).file_name().map(|file_name| dest.join(file_name))
    }
}

/// Run `write` against `<target>.part`, then move the result into place.
///
/// On failure the partial file is removed and `target` is never created.
fn write_member<F>(target: &Path, write: F) -> FinderResult<()>
where
    F: FnOnce(&Path) -> FinderResult<()>,
{
    let mut partial = target.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    // Leftover from an earlier interrupted run
    if partial.exists() {
        std::fs::remove_file(&partial)?;
    }

    match write(&partial).and_then(|()| std::fs::rename(&partial, target).map_err(FinderError::from)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}
