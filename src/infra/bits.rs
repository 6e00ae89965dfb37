use std::path::Path;

use anyhow::{anyhow, Context, Error};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{write::GzEncoder, Compression};

/// Pack an application directory (or single file) into a gzipped tarball.
pub fn pack(path: &Path) -> Result<Bytes, Error> {
    let tar_gz = BytesMut::new().writer();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);
    if path.is_dir() {
        tar.append_dir_all(".", path)
            .with_context(|| format!("Can't pack directory {}", path.display()))?;
    } else if path.is_file() {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("Can't detect file name of {}", path.display()))?;
        tar.append_path_with_name(path, name)
            .with_context(|| format!("Can't pack file {}", path.display()))?;
    } else {
        return Err(anyhow!("Application bits {} not found", path.display()));
    }
    let tar_gz = tar.into_inner()?.finish()?;
    Ok(tar_gz.into_inner().freeze())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn entries(packed: Bytes) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(packed.as_ref()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().display().to_string();
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                format!("{}={}", path, content)
            })
            .collect()
    }

    #[test]
    fn packs_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.ru"), "run App").unwrap();
        std::fs::create_dir(dir.path().join("public")).unwrap();
        std::fs::write(dir.path().join("public/index.html"), "hi").unwrap();

        let entries = entries(pack(dir.path()).unwrap());
        assert!(entries.iter().any(|entry| entry.ends_with("config.ru=run App")));
        assert!(entries
            .iter()
            .any(|entry| entry.ends_with("public/index.html=hi")));
    }

    #[test]
    fn packs_single_file_under_its_name() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("app.jar");
        std::fs::write(&jar, "PK").unwrap();
        assert_eq!(entries(pack(&jar).unwrap()), vec!["app.jar=PK".to_string()]);
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = pack(&dir.path().join("nope")).unwrap_err();
        assert!(error.to_string().contains("not found"));
    }
}
