use flate2::write::GzEncoder;
use flate2::Compression;
use methane_finder::io::archive::{ArchiveExtractor, ExtractionOutcome};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCENE: &str = "LC08_L2SP_163033_20181104_20200830_02_T1";

fn members() -> Vec<(String, &'static [u8])> {
    vec![
        (format!("{}/{}_SR_B4.TIF", SCENE, SCENE), b"band four".as_slice()),
        (format!("{}_SR_B6.TIF", SCENE), b"band six".as_slice()),
        (format!("{}_MTL.txt", SCENE), b"metadata".as_slice()),
        ("readme.txt".to_string(), b"hello".as_slice()),
        (format!("{}_SR_B4.jpg", SCENE), b"preview".as_slice()),
    ]
}

fn write_tar<W: Write>(writer: W) -> W {
    let mut builder = tar::Builder::new(writer);
    for (name, data) in members() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, &name, data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn make_tar(dir: &Path) -> PathBuf {
    let path = dir.join(format!("{}.tar", SCENE));
    write_tar(File::create(&path).unwrap());
    path
}

fn make_tar_gz(dir: &Path) -> PathBuf {
    let path = dir.join(format!("{}.tar.gz", SCENE));
    let encoder = write_tar(GzEncoder::new(File::create(&path).unwrap(), Compression::default()));
    encoder.finish().unwrap();
    path
}

fn make_zip(dir: &Path) -> PathBuf {
    let path = dir.join(format!("{}.zip", SCENE));
    let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
    let options = zip::write::FileOptions::default();
    for (name, data) in members() {
        zip.start_file(name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
    path
}

fn file_names(written: &[PathBuf]) -> Vec<String> {
    let mut names: Vec<String> = written
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn expected_bands() -> Vec<String> {
    vec![format!("{}_SR_B4.TIF", SCENE), format!("{}_SR_B6.TIF", SCENE)]
}

#[test]
fn test_tar_extracts_only_band_rasters() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let archive = make_tar(dir.path());

    let outcome = ArchiveExtractor::new(false).extract(&archive);
    match outcome {
        ExtractionOutcome::Extracted { written, skipped } => {
            assert_eq!(file_names(&written), expected_bands());
            assert_eq!(skipped, 0);
        }
        other => panic!("expected extraction, got {:?}", other),
    }

    // Members are flattened into the archive's own directory
    let b4 = dir.path().join(format!("{}_SR_B4.TIF", SCENE));
    assert_eq!(std::fs::read(&b4).unwrap(), b"band four");
    assert!(!dir.path().join(SCENE).exists());
    assert!(!dir.path().join("readme.txt").exists());
    assert!(!dir.path().join(format!("{}_SR_B4.jpg", SCENE)).exists());
    assert!(archive.exists());
}

#[test]
fn test_reextract_skips_existing_members() {
    let dir = TempDir::new().unwrap();
    let archive = make_tar(dir.path());
    let extractor = ArchiveExtractor::new(false);

    assert!(matches!(extractor.extract(&archive), ExtractionOutcome::Extracted { .. }));

    // A modified member must survive the second pass untouched
    let b6 = dir.path().join(format!("{}_SR_B6.TIF", SCENE));
    std::fs::write(&b6, b"edited").unwrap();

    match extractor.extract(&archive) {
        ExtractionOutcome::Extracted { written, skipped } => {
            assert!(written.is_empty());
            assert_eq!(skipped, 2);
        }
        other => panic!("expected extraction, got {:?}", other),
    }
    assert_eq!(std::fs::read(&b6).unwrap(), b"edited");
}

#[test]
fn test_corrupt_archive_reports_failure() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join(format!("{}.tar", SCENE));
    std::fs::write(&archive, vec![0xABu8; 2048]).unwrap();

    let outcome = ArchiveExtractor::new(true).extract(&archive);
    assert!(outcome.is_failed(), "got {:?}", outcome);
    // Nothing is deleted when extraction fails
    assert!(archive.exists());
}

fn large_member_tar() -> Vec<u8> {
    let data = vec![7u8; 4096];
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, format!("{}_SR_B4.TIF", SCENE), data.as_slice())
        .unwrap();
    builder.into_inner().unwrap()
}

#[test]
fn test_truncated_member_leaves_no_band_file() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join(format!("{}.tar", SCENE));
    let band = dir.path().join(format!("{}_SR_B4.TIF", SCENE));
    let partial = dir.path().join(format!("{}_SR_B4.TIF.part", SCENE));

    // Header plus the first 1000 bytes of a 4096-byte member
    let full = large_member_tar();
    std::fs::write(&archive, &full[..1512]).unwrap();

    let extractor = ArchiveExtractor::new(false);
    for _ in 0..2 {
        let outcome = extractor.extract(&archive);
        assert!(outcome.is_failed(), "got {:?}", outcome);
        assert!(!band.exists());
        assert!(!partial.exists());
    }

    // A good copy of the archive is extracted, not skipped
    std::fs::write(&archive, &full).unwrap();
    match extractor.extract(&archive) {
        ExtractionOutcome::Extracted { written, skipped } => {
            assert_eq!(written, vec![band.clone()]);
            assert_eq!(skipped, 0);
        }
        other => panic!("expected extraction, got {:?}", other),
    }
    assert_eq!(std::fs::read(&band).unwrap().len(), 4096);
}

#[test]
fn test_truncated_gzip_reports_failure() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join(format!("{}.tar.gz", SCENE));
    std::fs::write(&archive, b"not gzip at all").unwrap();

    assert!(ArchiveExtractor::new(false).extract(&archive).is_failed());
}

#[test]
fn test_tar_gz_archive() {
    let dir = TempDir::new().unwrap();
    let archive = make_tar_gz(dir.path());

    match ArchiveExtractor::new(false).extract(&archive) {
        ExtractionOutcome::Extracted { written, .. } => {
            assert_eq!(file_names(&written), expected_bands())
        }
        other => panic!("expected extraction, got {:?}", other),
    }
}

#[test]
fn test_zip_archive() {
    let dir = TempDir::new().unwrap();
    let archive = make_zip(dir.path());

    match ArchiveExtractor::new(false).extract(&archive) {
        ExtractionOutcome::Extracted { written, .. } => {
            assert_eq!(file_names(&written), expected_bands())
        }
        other => panic!("expected extraction, got {:?}", other),
    }
    let b6 = dir.path().join(format!("{}_SR_B6.TIF", SCENE));
    assert_eq!(std::fs::read(b6).unwrap(), b"band six");
}

#[test]
fn test_delete_archive_after_success() {
    let dir = TempDir::new().unwrap();
    let archive = make_tar(dir.path());

    let outcome = ArchiveExtractor::new(true).extract(&archive);
    assert!(matches!(outcome, ExtractionOutcome::Extracted { .. }));
    assert!(!archive.exists());
    assert!(dir.path().join(format!("{}_SR_B4.TIF", SCENE)).exists());
}

#[test]
fn test_plain_file_is_not_an_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(format!("{}_SR_B4.TIF", SCENE));
    std::fs::write(&path, b"raster").unwrap();

    assert!(matches!(
        ArchiveExtractor::new(true).extract(&path),
        ExtractionOutcome::NotAnArchive
    ));
    assert!(path.exists());
}
