//! Path filtering
//!
//! Monitors decide whether to report a path by running it through an ordered
//! chain of regular-expression filters: the first filter whose pattern
//! matches decides (include or exclude), and a path that matches no filter
//! is accepted.  Filters can also be loaded from a file, one record per
//! line.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::{Error, ErrorKind, Result};

/// Whether a matching filter accepts or rejects a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterKind {
    /// A matching path is reported.
    Include,
    /// A matching path is discarded.
    Exclude,
}

/// An uncompiled path filter.
///
/// `extended` selects the extended regular-expression dialect in the
/// on-disk filter format; the in-process engine has a single dialect, so the
/// field is carried for filter-file fidelity only.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MonitorFilter {
    /// The regular expression.
    pub text: String,
    /// Include or exclude.
    pub kind: FilterKind,
    /// Case sensitive match.  On by default.
    pub case_sensitive: bool,
    /// Extended regular expression syntax.
    pub extended: bool,
}

impl MonitorFilter {
    /// Creates an inclusion filter with default flags.
    pub fn include(text: impl Into<String>) -> Self {
        MonitorFilter {
            text: text.into(),
            kind: FilterKind::Include,
            case_sensitive: true,
            extended: false,
        }
    }

    /// Creates an exclusion filter with default flags.
    pub fn exclude(text: impl Into<String>) -> Self {
        MonitorFilter {
            text: text.into(),
            kind: FilterKind::Exclude,
            case_sensitive: true,
            extended: false,
        }
    }

    /// Toggles case sensitivity.
    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Toggles the extended flag.
    pub fn extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Reads filters from a file.
    ///
    /// Each line is either blank, a comment starting with `#`, or a record
    /// of the form `([+-])([ei]*) pattern`.  Malformed records are passed to
    /// `err_handler` and skipped.
    pub fn read_from_file<P, F>(path: P, mut err_handler: F) -> Result<Vec<MonitorFilter>>
    where
        P: AsRef<Path>,
        F: FnMut(&str),
    {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::io(e).add_path(path.as_ref().to_path_buf()))?;
        let mut filters = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::io)?;
            match parse_filter_line(&line) {
                ParsedLine::Filter(filter) => filters.push(filter),
                ParsedLine::Skip => {}
                ParsedLine::Malformed => err_handler(&line),
            }
        }

        Ok(filters)
    }
}

impl fmt::Display for MonitorFilter {
    /// Renders the filter in the filter-file line format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = match self.kind {
            FilterKind::Include => '+',
            FilterKind::Exclude => '-',
        };
        write!(f, "{sign}")?;
        if self.extended {
            write!(f, "e")?;
        }
        if !self.case_sensitive {
            write!(f, "i")?;
        }
        write!(f, " {}", self.text)
    }
}

enum ParsedLine {
    Filter(MonitorFilter),
    Skip,
    Malformed,
}

fn filter_grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| Regex::new("^([+-])([ei]*) (.+)$").unwrap())
}

/// A space at `i` counts as escaped when preceded by an odd number of
/// backslashes.
fn is_unescaped_space(text: &[u8], i: usize) -> bool {
    if text[i] != b' ' {
        return false;
    }

    let backslashes = text[..i].iter().rev().take_while(|&&b| b == b'\\').count();
    backslashes % 2 == 0
}

fn parse_filter_line(line: &str) -> ParsedLine {
    if line.is_empty() {
        return ParsedLine::Skip;
    }

    if line.starts_with('#') {
        return ParsedLine::Skip;
    }

    let Some(fragments) = filter_grammar().captures(line) else {
        return ParsedLine::Malformed;
    };

    let kind = match &fragments[1] {
        "+" => FilterKind::Include,
        _ => FilterKind::Exclude,
    };

    let mut case_sensitive = true;
    let mut extended = false;
    for flag in fragments[2].chars() {
        match flag {
            'e' => extended = true,
            'i' => case_sensitive = false,
            _ => unreachable!("rejected by the grammar"),
        }
    }

    // Trim unescaped trailing spaces from the pattern.
    let mut text = fragments[3].to_string();
    while text.len() > 1 && is_unescaped_space(text.as_bytes(), text.len() - 1) {
        text.pop();
    }

    if text.is_empty() || text == " " {
        return ParsedLine::Malformed;
    }

    ParsedLine::Filter(MonitorFilter {
        text,
        kind,
        case_sensitive,
        extended,
    })
}

struct CompiledFilter {
    regex: Regex,
    kind: FilterKind,
}

/// An ordered chain of compiled path filters.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<CompiledFilter>,
}

impl FilterChain {
    /// Creates an empty chain, which accepts every path.
    pub fn new() -> Self {
        FilterChain::default()
    }

    /// Compiles and appends a filter.  Existing filters are kept and
    /// insertion order is preserved.
    pub fn add(&mut self, filter: &MonitorFilter) -> Result<()> {
        let regex = RegexBuilder::new(&filter.text)
            .case_insensitive(!filter.case_sensitive)
            .build()
            .map_err(|_| Error::new(ErrorKind::InvalidRegex(filter.text.clone())))?;

        self.filters.push(CompiledFilter {
            regex,
            kind: filter.kind,
        });
        Ok(())
    }

    /// Replaces the whole chain.
    pub fn set(&mut self, filters: &[MonitorFilter]) -> Result<()> {
        let mut chain = FilterChain::new();
        for filter in filters {
            chain.add(filter)?;
        }
        *self = chain;
        Ok(())
    }

    /// Decides whether a path is reported.
    ///
    /// Filters are consulted in insertion order and the first match decides;
    /// a path matching no filter is accepted.
    pub fn accept(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();

        for filter in &self.filters {
            if filter.regex.is_match(&text) {
                return filter.kind == FilterKind::Include;
            }
        }

        true
    }

    /// Number of filters in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True when no filter was added.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}
