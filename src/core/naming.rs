//! File naming for simulator result files.
//!
//! A result file is named `<stem>.<seed>.erd`, where the stem is the recoil's
//! full name for plain runs, `<prefix>-opt` for recoil optimization and
//! `<prefix>-optfl` for fluence optimization.

use std::path::{Path, PathBuf};

use crate::core::domain::{OptimizationType, RecoilDistribution};

pub const ERD_SUFFIX: &str = "erd";
/// Pseudo-seed of the file holding concatenated results from earlier runs.
pub const COMBINED_SEED: &str = "combined";

/// Stem used by every file belonging to one run of `recoil`.
pub fn run_stem(recoil: &RecoilDistribution, optimization: Option<OptimizationType>) -> String {
    match optimization {
        None => recoil.full_name(),
        Some(OptimizationType::Recoil) => format!("{}-opt", recoil.prefix()),
        Some(OptimizationType::Fluence) => format!("{}-optfl", recoil.prefix()),
    }
}

pub fn erd_file_name(stem: &str, seed: u64) -> String {
    format!("{}.{}.{}", stem, seed, ERD_SUFFIX)
}

pub fn combined_file_name(stem: &str) -> String {
    format!("{}.{}.{}", stem, COMBINED_SEED, ERD_SUFFIX)
}

/// Middle component of `<stem>.<seed>.erd`. Stems may themselves contain dots.
pub fn seed_component(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    let mut parts = name.rsplitn(3, '.');
    let suffix = parts.next()?;
    let seed = parts.next()?;
    parts.next()?;
    if suffix != ERD_SUFFIX {
        return None;
    }
    Some(seed)
}

/// Numeric seed of a result file, if it has one.
pub fn seed_of(path: &Path) -> Option<u64> {
    seed_component(path)?.parse().ok()
}

/// True if `path` is a result file of the given stem. Any middle component is
/// accepted, so the `combined` file matches too.
pub fn is_erd_file(stem: &str, path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(rest) = name.strip_prefix(stem) else {
        return false;
    };
    rest.starts_with('.') && seed_component(path).is_some()
}

/// All result files of `stem` found directly inside `directory`, sorted.
pub fn matching_erd_files(directory: &Path, stem: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !directory.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && is_erd_file(stem, &path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Element;

    #[test]
    fn seed_is_middle_component() {
        assert_eq!(seed_of(Path::new("/tmp/4He-a.b.101.erd")), Some(101));
        assert_eq!(seed_of(Path::new("4He-x.combined.erd")), None);
        assert_eq!(seed_component(Path::new("4He-x.combined.erd")), Some("combined"));
        assert_eq!(seed_of(Path::new("4He-x.101.txt")), None);
        assert_eq!(seed_of(Path::new("plain.erd")), None);
    }

    #[test]
    fn stems_follow_the_run_kind() {
        let r = RecoilDistribution::new("default", Element::new("He", Some(4), 4.0026), vec![]);
        assert_eq!(run_stem(&r, None), "4He-default");
        assert_eq!(run_stem(&r, Some(OptimizationType::Recoil)), "4He-opt");
        assert_eq!(run_stem(&r, Some(OptimizationType::Fluence)), "4He-optfl");
        assert_eq!(erd_file_name("4He-opt", 7), "4He-opt.7.erd");
    }

    #[test]
    fn erd_file_matching() {
        assert!(is_erd_file("4He-default", Path::new("4He-default.101.erd")));
        assert!(is_erd_file("4He-default", Path::new("4He-default.combined.erd")));
        assert!(!is_erd_file("4He-default", Path::new("4He-default2.101.erd")));
        assert!(!is_erd_file("4He-default", Path::new("4He-default.101.out")));
        assert!(!is_erd_file("4He-opt", Path::new("4He-optfl.101.erd")));
    }
}
