//! Demo filename parsing.
//!
//! Game servers write demos as `pug_<map>_<YYYY-MM-DD_HH-MM>.dem`. Anything
//! else in the remote directory is not a demo and is skipped without error.

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::model::types::{DemoMetadata, demo_path};

/// Extension every demo file carries.
pub const DEMO_EXTENSION: &str = ".dem";

/// Layout of the timestamp token embedded in the filename.
pub const FILENAME_DATETIME_FORMAT: &str = "%Y-%m-%d_%H-%M";

static DEMO_FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^pug_(?P<map>\w+)_(?P<datetime>[\d_\-]+)\.dem$")
        .expect("demo filename pattern is valid")
});

/// Parse one remote filename into demo metadata.
///
/// Returns `None` for names that don't follow the demo layout, including
/// names whose timestamp token is not a real date or time.
pub fn parse(filename: &str, server: &str, demodir: &Path) -> Option<DemoMetadata> {
    let caps = DEMO_FILENAME_RE.captures(filename)?;
    let map = caps.name("map")?.as_str();
    let raw_datetime = caps.name("datetime")?.as_str();

    let captured_at = match NaiveDateTime::parse_from_str(raw_datetime, FILENAME_DATETIME_FORMAT) {
        Ok(dt) => dt,
        Err(e) => {
            tracing::debug!(filename, error = %e, "demo timestamp rejected");
            return None;
        }
    };

    Some(DemoMetadata {
        id: None,
        server: server.to_string(),
        filename: filename.to_string(),
        filepath: demo_path(demodir, server, filename),
        map: map.to_string(),
        captured_at,
    })
}

/// Parse a batch of filenames, keeping input order and dropping rejects.
pub fn parse_all<I, S>(server: &str, demodir: &Path, filenames: I) -> Vec<DemoMetadata>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    filenames
        .into_iter()
        .filter_map(|name| {
            let name = name.as_ref();
            let parsed = parse(name, server, demodir);
            if parsed.is_none() {
                tracing::debug!(server, filename = name, "skipping non-demo file");
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_reference_example() {
        let demo = parse("pug_dust2_2024-01-15_20-30.dem", "alpha", Path::new("/srv/demos"))
            .expect("valid demo name");
        assert_eq!(demo.server, "alpha");
        assert_eq!(demo.map, "dust2");
        assert_eq!(demo.datetime(), "2024-01-15 20:30");
        assert_eq!(demo.filename, "pug_dust2_2024-01-15_20-30.dem");
        assert_eq!(
            demo.filepath,
            PathBuf::from("/srv/demos/alpha/pug_dust2_2024-01-15_20-30.dem")
        );
        assert!(demo.id.is_none());
    }

    #[test]
    fn map_token_may_contain_underscores() {
        let demo = parse("pug_de_inferno_2023-12-31_23-59.dem", "a", Path::new("/d")).unwrap();
        assert_eq!(demo.map, "de_inferno");
        assert_eq!(demo.datetime(), "2023-12-31 23:59");
    }

    #[test]
    fn rejects_non_demo_names() {
        let dir = Path::new("/d");
        for name in [
            "readme.txt",
            "pug_dust2_2024-01-15_20-30.dem.bak",
            "scrim_dust2_2024-01-15_20-30.dem",
            "pug__2024-01-15_20-30.dem",
            "pug_dust2.dem",
            "pug_dust2_2024-01-15 20-30.dem",
            "",
        ] {
            assert!(parse(name, "a", dir).is_none(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn rejects_impossible_dates() {
        let dir = Path::new("/d");
        assert!(parse("pug_dust2_2024-13-01_20-30.dem", "a", dir).is_none());
        assert!(parse("pug_dust2_2023-02-29_20-30.dem", "a", dir).is_none());
        assert!(parse("pug_dust2_2024-01-15_24-00.dem", "a", dir).is_none());
        assert!(parse("pug_dust2_2024-01-15-20-30.dem", "a", dir).is_none());
    }

    #[test]
    fn normalizes_unpadded_tokens() {
        let demo = parse("pug_nuke_2024-1-5_9-3.dem", "a", Path::new("/d")).unwrap();
        assert_eq!(demo.datetime(), "2024-01-05 09:03");
    }

    #[test]
    fn parse_all_keeps_order_and_drops_rejects() {
        let names = [
            "pug_b_2024-01-02_00-00.dem",
            "notes.dem",
            "pug_a_2024-01-01_00-00.dem",
        ];
        let demos = parse_all("alpha", Path::new("/d"), names);
        let maps: Vec<_> = demos.iter().map(|d| d.map.as_str()).collect();
        assert_eq!(maps, ["b", "a"]);
    }
}
