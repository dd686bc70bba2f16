//! Local presence filter.
//!
//! A remote demo counts as already downloaded when a file with the same
//! name exists in the server's local directory. Only existence is checked;
//! a truncated or corrupt local copy is never re-fetched and has to be
//! deleted by hand to be downloaded again.

use std::collections::HashSet;
use std::path::Path;

/// Names from `candidates` with no file at `local_dir / name`, in input
/// order and without duplicates.
pub fn filter_new<I, S>(local_dir: &Path, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter_map(|name| {
            let name = name.as_ref();
            if !seen.insert(name.to_string()) {
                return None;
            }
            (!local_dir.join(name).is_file()).then(|| name.to_string())
        })
        .collect()
}
