//! Retires a dispatched staging directory into a single zip file.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::info;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{NotifyError, NotifyResult};
use crate::staging::StagingDir;

/// Compress `staging` into `<dir>.zip` beside it, then remove the directory.
///
/// The directory is only removed once the archive has been completely
/// written, so a failure leaves the staged artifacts where they were.
pub fn archive(staging: StagingDir) -> NotifyResult<PathBuf> {
    let dir = staging.into_path();
    let mut target = dir.clone().into_os_string();
    target.push(".zip");
    let target = PathBuf::from(target);

    let fail = |e: &dyn std::fmt::Display| NotifyError::archive(&target, e.to_string());

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|e| fail(&e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut entries = Vec::with_capacity(paths.len());
    for path in &paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Err(NotifyError::archive(
                &dir,
                format!("{} has a non UTF-8 name, directory left in place", path.display()),
            ));
        };
        entries.push((path, name));
    }

    let file = File::create(&target).map_err(|e| fail(&e))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (path, name) in &entries {
        zip.start_file(*name, options).map_err(|e| fail(&e))?;
        let mut source = File::open(path).map_err(|e| fail(&e))?;
        io::copy(&mut source, &mut zip).map_err(|e| fail(&e))?;
    }
    let mut file = zip.finish().map_err(|e| fail(&e))?;
    file.flush().map_err(|e| fail(&e))?;
    file.sync_all().map_err(|e| fail(&e))?;

    std::fs::remove_dir_all(&dir).map_err(|e| {
        NotifyError::archive(&dir, format!("archived to {} but not removed: {e}", target.display()))
    })?;

    info!(
        archive = %target.display(),
        files = entries.len(),
        "staging directory archived"
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;
    use zip::ZipArchive;

    #[test]
    fn test_archive_replaces_directory() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("20150625-090000");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p1.toml"), "subject = \"x\"\n").unwrap();
        std::fs::write(dir.join("manifest.txt"), "w1\tp1\n").unwrap();

        let target = archive(StagingDir::open(&dir).unwrap()).unwrap();
        assert_eq!(target, tmp.path().join("20150625-090000.zip"));
        assert!(!dir.exists());

        let mut zip = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        let mut manifest = String::new();
        zip.by_name("manifest.txt")
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        assert_eq!(manifest, "w1\tp1\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_unnameable_entry_keeps_directory() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("20150625-090000");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("p1.toml"), "subject = \"x\"\n").unwrap();
        std::fs::write(dir.join(OsStr::from_bytes(b"bad\xffname.toml")), "x").unwrap();

        let err = archive(StagingDir::open(&dir).unwrap()).unwrap_err();
        assert!(matches!(err, NotifyError::Archive { .. }));
        assert!(dir.join("p1.toml").exists());
        assert!(!tmp.path().join("20150625-090000.zip").exists());
    }
}
