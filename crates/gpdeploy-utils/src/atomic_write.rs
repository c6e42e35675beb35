//! Atomic file writes: temp file in the target directory, fsync, rename.

use camino::Utf8Path;
use std::fs;
use std::io::{self, Write};

use tempfile::NamedTempFile;

/// Atomically replace `path` with `content`, creating parent directories.
///
/// Readers either see the previous file or the complete new one.
pub fn write_file_atomic(path: &Utf8Path, content: &str) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(normalize_line_endings(content).as_bytes())?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path.as_std_path()).map_err(|e| e.error)?;
    Ok(())
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn creates_parents_and_replaces() {
        let td = tempfile::TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(td.path().join("state/mdw.json")).unwrap();

        write_file_atomic(&path, "{\"v\":1}\r\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":1}\n");

        write_file_atomic(&path, "{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
