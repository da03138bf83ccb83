//! Granule file name parsing and destination layout.
//!
//! OBPG Level-2 granules written by the SST pipeline embed the orbit number
//! and the start time of the granule in their name, e.g.
//! `AQUA_MODIS_orbit_049174_20110523T063000_L2_SST.nc4`. The year and month
//! of that timestamp decide where the granule lands in the archive:
//! `<destination_root>/<category>/<YYYY>/<MM>/<file name>`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

/// Underscore, six-digit orbit number, underscore, `YYYYMMDD`, then `T`.
/// Group 1 is the year, group 2 the month.
pub const GRANULE_DATE_PATTERN: &str = r"_\d{6}_(\d{4})(\d{2})\d{2}T";

static GRANULE_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(GRANULE_DATE_PATTERN).expect("granule date pattern is a valid regex")
});

/// Year and month taken from a granule file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GranuleDate {
    pub year: u16,
    pub month: u8,
}

impl GranuleDate {
    /// `YYYY` directory name.
    pub fn year_dir(&self) -> String {
        format!("{:04}", self.year)
    }

    /// `MM` directory name.
    pub fn month_dir(&self) -> String {
        format!("{:02}", self.month)
    }
}

impl fmt::Display for GranuleDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Extract the granule year and month from a file name.
///
/// The digits are taken as written; the month is not checked against the
/// calendar so the destination directory always mirrors the name.
pub fn parse_granule_date(file_name: &str) -> Option<GranuleDate> {
    let caps = GRANULE_DATE_RE.captures(file_name)?;
    let year = caps.get(1)?.as_str().parse().ok()?;
    let month = caps.get(2)?.as_str().parse().ok()?;
    Some(GranuleDate { year, month })
}

/// `true` if `path` has the wanted extension, or if no extension is wanted.
pub fn has_extension(path: &Path, extension: Option<&str>) -> bool {
    match extension {
        None => true,
        Some(wanted) => path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext == wanted.trim_start_matches('.')),
    }
}

/// Archive directory for a granule. An empty category is skipped.
pub fn destination_dir(root: &Path, category: &str, date: GranuleDate) -> PathBuf {
    let mut dir = root.to_path_buf();
    if !category.is_empty() {
        dir.push(category);
    }
    dir.push(date.year_dir());
    dir.push(date.month_dir());
    dir
}

/// Full archive path for a granule file name.
pub fn destination_path(root: &Path, category: &str, date: GranuleDate, file_name: &str) -> PathBuf {
    destination_dir(root, category, date).join(file_name)
}

/// Resolve a bare file name straight to its archive path, `None` if the name
/// carries no granule date.
pub fn resolve(root: &Path, category: &str, file_name: &str) -> Option<PathBuf> {
    parse_granule_date(file_name).map(|date| destination_path(root, category, date, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_obpg_granule_names() {
        let date = parse_granule_date("AQUA_MODIS_orbit_049174_20110523T063000_L2_SST.nc4").unwrap();
        assert_eq!(date, GranuleDate { year: 2011, month: 5 });
        assert_eq!(date.year_dir(), "2011");
        assert_eq!(date.month_dir(), "05");
        assert_eq!(date.to_string(), "2011-05");
    }

    #[test]
    fn month_directory_mirrors_the_name() {
        let date = parse_granule_date("x_123456_20021231T235959.nc4").unwrap();
        assert_eq!((date.year_dir().as_str(), date.month_dir().as_str()), ("2002", "12"));

        // Digits are taken literally, not validated.
        let odd = parse_granule_date("x_123456_20111301T0000.nc4").unwrap();
        assert_eq!(odd.month_dir(), "13");
    }

    #[test]
    fn first_match_wins() {
        let date = parse_granule_date("a_000001_20050101T_b_000002_20060606T.nc4").unwrap();
        assert_eq!(date, GranuleDate { year: 2005, month: 1 });
    }

    #[test]
    fn rejects_names_without_the_date_block() {
        for name in [
            "AQUA_MODIS_abc_201105230630T.nc4",
            "AQUA_MODIS_20110523T063000_L2_SST.nc4",
            "x_12345_20110523T.nc4",
            "x_123456_20110523.nc4",
            "x_123456_2011052T.nc4",
            "x-123456-20110523T.nc4",
            "",
        ] {
            assert_eq!(parse_granule_date(name), None, "{} should not match", name);
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let name = "TERRA_MODIS_orbit_012345_20190704T120000_L2_SST.nc4";
        assert_eq!(parse_granule_date(name), parse_granule_date(name));
    }

    #[test]
    fn extension_filter() {
        assert!(has_extension(Path::new("/a/b.nc4"), Some("nc4")));
        assert!(has_extension(Path::new("/a/b.nc4"), Some(".nc4")));
        assert!(!has_extension(Path::new("/a/b.nc4.tmp"), Some("nc4")));
        assert!(!has_extension(Path::new("/a/b.NC4"), Some("nc4")));
        assert!(!has_extension(Path::new("/a/b"), Some("nc4")));
        assert!(has_extension(Path::new("/a/b"), None));
    }

    #[test]
    fn destination_layout() {
        let date = GranuleDate { year: 2011, month: 5 };
        assert_eq!(
            destination_dir(Path::new("/mnt/archive"), "SST", date),
            PathBuf::from("/mnt/archive/SST/2011/05")
        );
        assert_eq!(
            destination_dir(Path::new("/mnt/archive"), "", date),
            PathBuf::from("/mnt/archive/2011/05")
        );
        assert_eq!(
            resolve(Path::new("/mnt/archive"), "SST", "A_000001_20110523T0630.nc4"),
            Some(PathBuf::from("/mnt/archive/SST/2011/05/A_000001_20110523T0630.nc4"))
        );
        assert_eq!(resolve(Path::new("/mnt/archive"), "SST", "notes.txt"), None);
    }
}
