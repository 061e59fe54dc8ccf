use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Every `.csv` file below `root` whose name contains one of `patterns`,
/// sorted by path. An empty pattern list accepts every CSV.
pub fn find_csv_files(root: &Path, patterns: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
        })
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            patterns.is_empty() || patterns.iter().any(|p| name.contains(p.as_str()))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Plant and machine a source file belongs to: `<root>/<plant>/<machine>/<file>`.
pub fn attribute(root: &Path, file: &Path) -> Result<(String, String), String> {
    let relative = file.strip_prefix(root).unwrap_or(file);
    let dirs: Vec<&str> = relative
        .parent()
        .map(|p| p.iter().filter_map(|c| c.to_str()).collect())
        .unwrap_or_default();
    match dirs.as_slice() {
        [.., plant, machine] => Ok((plant.to_string(), machine.to_string())),
        _ => Err(format!(
            "{} is not under <plant>/<machine>/; pass --plant and --machine",
            file.display()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn finds_matching_csvs_recursively() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        touch(root, "P1/M1/2024_Vib.csv");
        touch(root, "P1/M1/2024_Tmp.CSV");
        touch(root, "P1/M2/deep/Cond_01.csv");
        touch(root, "P1/M1/notes.csv");
        touch(root, "P1/M1/Vib.txt");

        let patterns = vec!["Cond".to_string(), "Vib".into(), "Tmp".into()];
        let found: Vec<PathBuf> = find_csv_files(root, &patterns)
            .into_iter()
            .map(|p| p.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("P1/M1/2024_Tmp.CSV"),
                PathBuf::from("P1/M1/2024_Vib.csv"),
                PathBuf::from("P1/M2/deep/Cond_01.csv"),
            ]
        );
    }

    #[test]
    fn empty_patterns_accept_every_csv() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.csv");
        touch(dir.path(), "b/c.csv");
        assert_eq!(find_csv_files(dir.path(), &[]).len(), 2);
    }

    #[test]
    fn missing_root_finds_nothing() {
        let dir = tempdir().unwrap();
        assert!(find_csv_files(&dir.path().join("nope"), &[]).is_empty());
    }

    #[test]
    fn attribution_from_directories() {
        let root = Path::new("/src");
        assert_eq!(
            attribute(root, Path::new("/src/P1/M1/Vib.csv")).unwrap(),
            ("P1".to_string(), "M1".to_string())
        );
        assert_eq!(
            attribute(root, Path::new("/src/site/P1/M7/Vib.csv")).unwrap(),
            ("P1".to_string(), "M7".to_string())
        );
        assert!(attribute(root, Path::new("/src/M1/Vib.csv")).is_err());
        assert!(attribute(root, Path::new("/src/Vib.csv")).is_err());
    }
}
