//! Relay include / exclude filtering.
//!
//! A [`RelayFilter`] decides which exports get a relay stub at all. It is matched against
//! the diagnostic label `"<module>.<ordinal>: <name>"` of an export; an item matches when it
//! equals, ignoring case, either the `<module>.<ordinal>` part, the `<module>` part, or the
//! function name.
//!
//! With an exclude list everything is shown except matching items. Otherwise, with an include
//! list, only matching items are shown. Without either list everything is shown.

use std::str::FromStr;

use crate::Error;

/// Include / exclude lists for relay stubs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl RelayFilter {
    /// A filter that shows every export.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the include list with the `;`-separated items of `list`.
    #[must_use]
    pub fn include(mut self, list: &str) -> Self {
        self.include = split_items(list);
        self
    }

    /// Replaces the exclude list with the `;`-separated items of `list`.
    #[must_use]
    pub fn exclude(mut self, list: &str) -> Self {
        self.exclude = split_items(list);
        self
    }

    /// Returns `true` if neither list restricts anything.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Decides whether the export described by `label` gets a relay stub.
    ///
    /// A label without the `": "` separator cannot be matched and is shown.
    #[must_use]
    pub fn shows(&self, label: &str) -> bool {
        let (list, show) = if !self.exclude.is_empty() {
            (&self.exclude, true)
        } else if !self.include.is_empty() {
            (&self.include, false)
        } else {
            return true;
        };

        let Some((qualified, function)) = label.split_once(": ") else {
            return true;
        };
        let module = qualified.split('.').next().unwrap_or(qualified);

        let matched = list.iter().any(|item| {
            item.eq_ignore_ascii_case(qualified)
                || item.eq_ignore_ascii_case(module)
                || item.eq_ignore_ascii_case(function)
        });

        if matched {
            !show
        } else {
            show
        }
    }
}

impl FromStr for RelayFilter {
    type Err = Error;

    /// Parses `"include=<items>"`, `"exclude=<items>"` or both separated by `|`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let mut filter = RelayFilter::new();
        for part in spec.split('|').map(str::trim).filter(|part| !part.is_empty()) {
            match part.split_once('=') {
                Some(("include", items)) => filter.include = split_items(items),
                Some(("exclude", items)) => filter.exclude = split_items(items),
                _ => {
                    return Err(Error::Config(format!(
                        "relay filter part '{part}' is neither include= nor exclude="
                    )))
                }
            }
        }
        Ok(filter)
    }
}

fn split_items(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_filter_shows_everything() {
        let filter = RelayFilter::new();
        assert!(filter.is_open());
        assert!(filter.shows("KERNEL32.5: GetVersion"));
    }

    #[test]
    fn include_list() {
        let filter = RelayFilter::new().include("user32; kernel32.7 ;lstrlenA");
        assert!(filter.shows("USER32.12: MessageBoxA"));
        assert!(filter.shows("KERNEL32.7: Beep"));
        assert!(!filter.shows("KERNEL32.8: CloseHandle"));
        assert!(filter.shows("KERNEL32.44: LSTRLENA"));
        assert!(!filter.shows("GDI32.1: TextOutA"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = RelayFilter::new()
            .include("GDI32")
            .exclude("kernel32;RtlUnwind");
        assert!(!filter.shows("KERNEL32.1: GetTickCount"));
        assert!(!filter.shows("NTDLL.3: RtlUnwind"));
        assert!(filter.shows("USER32.2: GetDC"));
    }

    #[test]
    fn unlabeled_entries_are_shown() {
        let filter = RelayFilter::new().include("USER32");
        assert!(filter.shows("garbage"));
    }

    #[test]
    fn parse() {
        let filter: RelayFilter = "include=USER32;GDI32 | exclude=GetDC".parse().unwrap();
        assert!(!filter.shows("USER32.2: GetDC"));
        assert!(filter.shows("NTDLL.2: NtClose"));
        assert!("sideways=1".parse::<RelayFilter>().is_err());
        assert!("".parse::<RelayFilter>().unwrap().is_open());
    }
}
