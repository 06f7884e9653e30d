//! Journal domain library.
//! A title-keyed entry store over plain-text `.journal` files, with a query engine,
//! grouped statistics, a reference graph and a formatting lint that gates the cache.

pub mod core {
    use chrono::{Datelike, NaiveDate, Weekday};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::{
        borrow::Borrow,
        cmp::Ordering,
        convert::Infallible,
        fmt,
        hash::{Hash, Hasher},
        path::{Path, PathBuf},
        str::FromStr,
    };

    /* ------------------------------- Title ------------------------------- */

    /// First line of a journal record and the store's primary key.
    ///
    /// Date titles (`YYYY-MM-DD` with an optional `, Weekday` suffix) are keyed by
    /// their ISO date so the long and short forms compare equal; any other text is
    /// keyed by itself.
    #[derive(Debug, Clone)]
    pub struct Title {
        raw: String,
        key: String,
        date: Option<NaiveDate>,
        weekday: Option<Weekday>,
    }

    impl Title {
        pub fn new(raw: &str) -> Self {
            crate::parser::parse_title_line(raw)
        }

        pub(crate) fn from_parts(
            raw: String,
            date: Option<NaiveDate>,
            weekday: Option<Weekday>,
        ) -> Self {
            let key = match date {
                Some(date) => date.format("%Y-%m-%d").to_string(),
                None => raw.clone(),
            };
            Self {
                raw,
                key,
                date,
                weekday,
            }
        }

        pub fn raw(&self) -> &str {
            &self.raw
        }

        /// Normalized form used for equality, ordering and lookups.
        pub fn key(&self) -> &str {
            &self.key
        }

        pub fn is_date(&self) -> bool {
            self.date.is_some()
        }

        pub fn date(&self) -> Option<NaiveDate> {
            self.date
        }

        pub fn weekday_suffix(&self) -> Option<Weekday> {
            self.weekday
        }

        /// `YYYY-MM-DD, Weekday` rather than a bare date.
        pub fn is_long_form(&self) -> bool {
            self.weekday.is_some()
        }

        /// False only when a weekday suffix names the wrong day.
        pub fn weekday_matches(&self) -> bool {
            match (self.date, self.weekday) {
                (Some(date), Some(weekday)) => date.weekday() == weekday,
                _ => true,
            }
        }

        /// ISO prefix at the given granularity; `None` for free-text titles.
        pub fn iso(&self, unit: TimeUnit) -> Option<&str> {
            self.date.map(|_| &self.key[..unit.prefix_len()])
        }
    }

    impl PartialEq for Title {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    impl Eq for Title {}

    impl PartialOrd for Title {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Title {
        fn cmp(&self, other: &Self) -> Ordering {
            self.key.cmp(&other.key)
        }
    }

    impl Hash for Title {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.key.hash(state);
        }
    }

    impl Borrow<str> for Title {
        fn borrow(&self) -> &str {
            &self.key
        }
    }

    impl fmt::Display for Title {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.raw)
        }
    }

    impl FromStr for Title {
        type Err = Infallible;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Ok(Self::new(s))
        }
    }

    /* ------------------------------ TimeUnit ------------------------------ */

    /// Granularity used to bucket date titles.
    #[derive(
        Debug,
        Clone,
        Copy,
        Default,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        clap::ValueEnum,
    )]
    pub enum TimeUnit {
        #[default]
        Year,
        Month,
        Day,
    }

    impl TimeUnit {
        pub fn prefix_len(self) -> usize {
            match self {
                TimeUnit::Year => 4,
                TimeUnit::Month => 7,
                TimeUnit::Day => 10,
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                TimeUnit::Year => "year",
                TimeUnit::Month => "month",
                TimeUnit::Day => "day",
            }
        }
    }

    /* -------------------------------- Entry -------------------------------- */

    /// One journal record.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Entry {
        #[serde_as(as = "DisplayFromStr")]
        pub title: Title,
        /// Path of the source file relative to the journal directory.
        pub rel_path: PathBuf,
        /// 1-based line of the title within `rel_path`.
        pub line_num: usize,
        /// Whole record including the title line.
        pub text: String,
    }

    impl Entry {
        pub fn words(&self) -> usize {
            self.text.split_whitespace().count()
        }

        pub fn size(&self) -> usize {
            self.text.chars().count()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum JournalError {
        #[error("no journal entries found in {}", directory.display())]
        EmptyStore { directory: PathBuf },
        #[error(
            "invalid date spec {spec:?} ({reason}); expected [YYYY[-MM[-DD]]][:][YYYY[-MM[-DD]]][,...]"
        )]
        InvalidDateSpec { spec: String, reason: String },
        #[error("invalid search term {term:?}")]
        InvalidTerm {
            term: String,
            #[source]
            source: regex::Error,
        },
        #[error("i/o error on {}", path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("malformed cache {}", path.display())]
        Cache {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
        #[error("refusing to write cache and tags for a journal that has not passed verification")]
        NotVerified,
    }

    impl JournalError {
        pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
            move |source| JournalError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub type Result<T, E = JournalError> = std::result::Result<T, E>;

}

pub mod parser {
    //! `nom` parsers for titles, partial dates and the date-range grammar, plus the
    //! blank-line record splitter.

    use crate::core::{Entry, JournalError, Result, Title};
    use crate::query::DateRange;
    use chrono::{Months, NaiveDate, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while_m_n},
        character::complete::char,
        combinator::{all_consuming, map, map_res, opt, recognize},
        error::VerboseError,
        multi::separated_list1,
        sequence::{pair, preceded, tuple},
    };
    use std::{path::Path, str::FromStr};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------------- Titles ------------------------------- */

    /// Classify a record's first line. Never fails: anything that is not a
    /// well-formed date title is free text.
    pub fn parse_title_line(line: &str) -> Title {
        match date_title(line) {
            Ok((_, (date, weekday))) => Title::from_parts(line.to_string(), Some(date), weekday),
            Err(_) => Title::from_parts(line.to_string(), None, None),
        }
    }

    /// The line starts with something shaped like `YYYY-MM-DD`.
    pub fn looks_like_date(line: &str) -> bool {
        ymd(line).is_ok()
    }

    /// The line starts with a date shape that names no real day (e.g. `2021-02-30`).
    pub fn has_impossible_date(line: &str) -> bool {
        looks_like_date(line) && date(line).is_err()
    }

    fn date_title(i: &str) -> PResult<'_, (NaiveDate, Option<Weekday>)> {
        all_consuming(pair(date, opt(preceded(tag(", "), weekday))))(i)
    }

    fn weekday(i: &str) -> PResult<'_, Weekday> {
        map_res(
            alt((
                tag("Monday"),
                tag("Tuesday"),
                tag("Wednesday"),
                tag("Thursday"),
                tag("Friday"),
                tag("Saturday"),
                tag("Sunday"),
            )),
            |s: &str| s.parse::<Weekday>(),
        )(i)
    }

    fn date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(ymd, |(y, m, d)| {
            NaiveDate::from_ymd_opt(y, m, d).ok_or("no such date")
        })(i)
    }

    fn ymd(i: &str) -> PResult<'_, (i32, u32, u32)> {
        tuple((
            number::<i32>(4),
            preceded(char('-'), number::<u32>(2)),
            preceded(char('-'), number::<u32>(2)),
        ))(i)
    }

    fn digits<'a>(width: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(width, width, |c: char| c.is_ascii_digit())
    }

    fn number<'a, T: FromStr>(width: usize) -> impl FnMut(&'a str) -> PResult<'a, T> {
        map_res(digits(width), |s: &'a str| s.parse::<T>())
    }

    /* ---------------------------- Partial dates ---------------------------- */

    /// `YYYY`, `YYYY-MM` or `YYYY-MM-DD`; the period it names.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PartialDate {
        pub year: i32,
        pub month: Option<u32>,
        pub day: Option<u32>,
    }

    impl PartialDate {
        pub fn first_day(&self) -> Option<NaiveDate> {
            NaiveDate::from_ymd_opt(self.year, self.month.unwrap_or(1), self.day.unwrap_or(1))
        }

        /// First day after the period.
        pub fn next_period(&self) -> Option<NaiveDate> {
            let first = self.first_day()?;
            match (self.month, self.day) {
                (_, Some(_)) => first.succ_opt(),
                (Some(_), None) => first.checked_add_months(Months::new(1)),
                (None, None) => first.checked_add_months(Months::new(12)),
            }
        }

        pub fn last_day(&self) -> Option<NaiveDate> {
            self.next_period()?.pred_opt()
        }
    }

    fn partial_date(i: &str) -> PResult<'_, PartialDate> {
        map(
            pair(
                number::<i32>(4),
                opt(pair(
                    preceded(char('-'), number::<u32>(2)),
                    opt(preceded(char('-'), number::<u32>(2))),
                )),
            ),
            |(year, rest)| {
                let (month, day) = rest.map_or((None, None), |(m, d)| (Some(m), d));
                PartialDate { year, month, day }
            },
        )(i)
    }

    pub fn parse_partial_date(s: &str) -> Option<PartialDate> {
        all_consuming(partial_date)(s).ok().map(|(_, p)| p)
    }

    /* ------------------------------ Date specs ------------------------------ */

    #[derive(Debug, Clone, Copy)]
    enum RangeSyntax {
        Period(PartialDate),
        Span(Option<PartialDate>, Option<PartialDate>),
    }

    impl RangeSyntax {
        fn resolve(self) -> std::result::Result<DateRange, &'static str> {
            let first_day = |p: PartialDate| p.first_day().ok_or("no such date");
            let range = match self {
                RangeSyntax::Period(p) => DateRange {
                    start: Some(first_day(p)?),
                    end: Some(p.next_period().ok_or("no such date")?),
                },
                RangeSyntax::Span(start, end) => DateRange {
                    start: start.map(first_day).transpose()?,
                    end: end.map(first_day).transpose()?,
                },
            };
            match (range.start, range.end) {
                (Some(start), Some(end)) if end < start => Err("range ends before it starts"),
                _ => Ok(range),
            }
        }
    }

    fn range_syntax(i: &str) -> PResult<'_, RangeSyntax> {
        alt((
            map(
                tuple((opt(partial_date), char(':'), opt(partial_date))),
                |(start, _, end)| RangeSyntax::Span(start, end),
            ),
            map(partial_date, RangeSyntax::Period),
        ))(i)
    }

    /// Parse `[YYYY[-MM[-DD]]][:][YYYY[-MM[-DD]]][,...]` into half-open ranges.
    ///
    /// A bare period covers itself (`2020-01` is all of January); `A:B` runs from the
    /// first day of `A` up to, not including, the first day of `B`; a missing side is
    /// left open for the filter to close against the selected entries.
    pub fn parse_date_spec(spec: &str) -> Result<Vec<DateRange>> {
        let invalid = |reason: &str| JournalError::InvalidDateSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (_, ranges) = all_consuming(separated_list1(char(','), range_syntax))(spec)
            .map_err(|_| invalid("unrecognized syntax"))?;
        ranges
            .into_iter()
            .map(|r| r.resolve().map_err(invalid))
            .collect()
    }

    /* ------------------------------- Records ------------------------------- */

    /// A blank-line-delimited run of lines.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RawRecord<'a> {
        /// 1-based line number of the first line.
        pub line_num: usize,
        pub lines: Vec<&'a str>,
    }

    impl<'a> RawRecord<'a> {
        pub fn first_line(&self) -> &'a str {
            self.lines.first().copied().unwrap_or_default()
        }

        /// Records that open with an unindented line carry a title.
        pub fn is_titled(&self) -> bool {
            let first = self.first_line();
            !first.is_empty() && !first.starts_with(char::is_whitespace)
        }

        pub fn text(&self) -> String {
            self.lines.join("\n")
        }
    }

    pub fn split_records(text: &str) -> Vec<RawRecord<'_>> {
        let mut records = Vec::new();
        let mut current: Option<RawRecord<'_>> = None;
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                records.extend(current.take());
            } else {
                current
                    .get_or_insert_with(|| RawRecord {
                        line_num: idx + 1,
                        lines: Vec::new(),
                    })
                    .lines
                    .push(line);
            }
        }
        records.extend(current);
        records
    }

    /// Parse the entries of one journal file.
    pub fn parse_journal_str(rel_path: &Path, text: &str) -> Vec<Entry> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        split_records(text)
            .into_iter()
            .filter(RawRecord::is_titled)
            .map(|record| Entry {
                title: parse_title_line(record.first_line()),
                rel_path: rel_path.to_path_buf(),
                line_num: record.line_num,
                text: record.text(),
            })
            .collect()
    }

    /* ------------------------------- BibTeX ------------------------------- */

    fn bibtex_open(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            char('@'),
            take_while(|c: char| c.is_ascii_lowercase()),
            char('{'),
        )))(i)
    }

    /// Citation key of an `@type{key,` line.
    pub fn bibtex_key(line: &str) -> Option<&str> {
        let (rest, _) = bibtex_open(line).ok()?;
        rest.strip_suffix(',').filter(|key| !key.is_empty())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn span_is_half_open_on_first_days() {
            let ranges = parse_date_spec("2020-01:2020-03").unwrap();
            assert_eq!(
                ranges,
                vec![DateRange {
                    start: Some(ymd(2020, 1, 1)),
                    end: Some(ymd(2020, 3, 1)),
                }]
            );
        }

        #[test]
        fn bare_periods_cover_themselves() {
            let ranges = parse_date_spec("2020,2021-02,2020-02-28").unwrap();
            assert_eq!(ranges[0].start, Some(ymd(2020, 1, 1)));
            assert_eq!(ranges[0].end, Some(ymd(2021, 1, 1)));
            assert_eq!(ranges[1].start, Some(ymd(2021, 2, 1)));
            assert_eq!(ranges[1].end, Some(ymd(2021, 3, 1)));
            assert_eq!(ranges[2].start, Some(ymd(2020, 2, 28)));
            assert_eq!(ranges[2].end, Some(ymd(2020, 2, 29)));
        }

        #[test]
        fn open_sides_stay_open() {
            assert_eq!(parse_date_spec(":").unwrap(), vec![DateRange::default()]);
            let ranges = parse_date_spec(":2020,2019-06:").unwrap();
            assert_eq!(ranges[0].start, None);
            assert_eq!(ranges[0].end, Some(ymd(2020, 1, 1)));
            assert_eq!(ranges[1].start, Some(ymd(2019, 6, 1)));
            assert_eq!(ranges[1].end, None);
        }

        #[test]
        fn malformed_specs_are_rejected() {
            for spec in [
                "", "20", "2020-1", "2020-13", "2020-02-30", "2020:2019", "2020,,2021", "abc",
                "2020:2021:2022",
            ] {
                let err = parse_date_spec(spec).unwrap_err();
                assert!(
                    matches!(err, JournalError::InvalidDateSpec { .. }),
                    "{spec:?} gave {err:?}"
                );
            }
        }

        #[test]
        fn records_split_on_blank_lines_with_line_numbers() {
            let text = "2021-01-01\n\tone\n\n2021-01-02\n \n\n\torphan\n";
            let records = split_records(text);
            assert_eq!(records.len(), 3);
            assert_eq!(records[0].line_num, 1);
            assert_eq!(records[0].text(), "2021-01-01\n\tone");
            assert_eq!(records[1].line_num, 4);
            assert_eq!(records[2].line_num, 7);
            assert!(!records[2].is_titled());
        }

        #[test]
        fn journal_parsing_skips_untitled_records_and_bom() {
            let text = "\u{feff}2021-01-01, Friday\n\tfirst\n\n\tstray\n\nIdeas\n\tmore\n";
            let entries = parse_journal_str(Path::new("a.journal"), text);
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].title.key(), "2021-01-01");
            assert_eq!(entries[0].text, "2021-01-01, Friday\n\tfirst");
            assert_eq!(entries[1].title.key(), "Ideas");
            assert_eq!(entries[1].line_num, 6);
        }

        #[test]
        fn impossible_dates_are_detected() {
            assert!(has_impossible_date("2021-02-30"));
            assert!(!has_impossible_date("2021-02-28"));
            assert!(!has_impossible_date("Notes"));
        }

        #[test]
        fn bibtex_keys() {
            assert_eq!(bibtex_key("@article{smith2020,"), Some("smith2020"));
            assert_eq!(bibtex_key("@book{knuth1984,"), Some("knuth1984"));
            assert_eq!(bibtex_key("\tauthor = {Smith},"), None);
            assert_eq!(bibtex_key("@misc{,"), None);
        }
    }
}

pub mod query {
    //! Boolean AND of regex terms combined with a union of date ranges.

    use crate::core::{Entry, JournalError, Result};
    use crate::parser::parse_date_spec;
    use chrono::NaiveDate;
    use regex::{Regex, RegexBuilder};
    use std::{collections::BTreeMap, str::FromStr};

    /// Filtered entries keyed by title key, in title order.
    pub type Selection<'a> = BTreeMap<&'a str, &'a Entry>;

    /// Half-open `[start, end)`; `None` bounds are closed against the candidates.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DateRange {
        pub start: Option<NaiveDate>,
        pub end: Option<NaiveDate>,
    }

    impl DateRange {
        /// Close open bounds with the earliest date and the day after the latest.
        pub fn resolve(&self, earliest: NaiveDate, latest: NaiveDate) -> (NaiveDate, NaiveDate) {
            let start = self.start.unwrap_or(earliest);
            let end = self
                .end
                .unwrap_or_else(|| latest.succ_opt().unwrap_or(NaiveDate::MAX));
            (start, end)
        }
    }

    /// A parsed `-d` argument; keeps the original text for the search log.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DateSpec {
        raw: String,
        ranges: Vec<DateRange>,
    }

    impl DateSpec {
        pub fn as_str(&self) -> &str {
            &self.raw
        }

        pub fn ranges(&self) -> &[DateRange] {
            &self.ranges
        }
    }

    impl FromStr for DateSpec {
        type Err = JournalError;

        fn from_str(s: &str) -> Result<Self> {
            Ok(Self {
                raw: s.to_string(),
                ranges: parse_date_spec(s)?,
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryOptions {
        pub ignore_case: bool,
        pub whole_words: bool,
        pub dates_only: bool,
    }

    impl Default for QueryOptions {
        fn default() -> Self {
            Self {
                ignore_case: true,
                whole_words: false,
                dates_only: false,
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Query {
        terms: Vec<Regex>,
        ranges: Vec<DateRange>,
        dates_only: bool,
    }

    impl Query {
        pub fn new<S: AsRef<str>>(
            terms: &[S],
            ranges: Vec<DateRange>,
            options: QueryOptions,
        ) -> Result<Self> {
            let terms = terms
                .iter()
                .map(|term| compile_term(term.as_ref(), options))
                .collect::<Result<Vec<_>>>()?;
            Ok(Self {
                terms,
                ranges,
                dates_only: options.dates_only,
            })
        }

        /// Matches every entry.
        pub fn everything() -> Self {
            Self {
                terms: Vec::new(),
                ranges: Vec::new(),
                dates_only: false,
            }
        }

        pub fn matches_text(&self, text: &str) -> bool {
            self.terms.iter().all(|term| term.is_match(text))
        }

        fn restricts_to_dates(&self) -> bool {
            self.dates_only || !self.ranges.is_empty()
        }
    }

    fn compile_term(term: &str, options: QueryOptions) -> Result<Regex> {
        let pattern = if options.whole_words {
            format!(r"\b(?:{term})\b")
        } else {
            term.to_string()
        };
        RegexBuilder::new(&pattern)
            .case_insensitive(options.ignore_case)
            .multi_line(true)
            .build()
            .map_err(|source| JournalError::InvalidTerm {
                term: term.to_string(),
                source,
            })
    }

    pub fn filter<'a>(entries: impl IntoIterator<Item = &'a Entry>, query: &Query) -> Selection<'a> {
        let candidates: Vec<&'a Entry> = entries
            .into_iter()
            .filter(|entry| !query.restricts_to_dates() || entry.title.is_date())
            .collect();
        let candidates = if query.ranges.is_empty() {
            candidates
        } else {
            within_ranges(candidates, &query.ranges)
        };
        candidates
            .into_iter()
            .filter(|entry| query.matches_text(&entry.text))
            .map(|entry| (entry.title.key(), entry))
            .collect()
    }

    fn within_ranges<'a>(candidates: Vec<&'a Entry>, ranges: &[DateRange]) -> Vec<&'a Entry> {
        let bounds = candidates
            .iter()
            .filter_map(|entry| entry.title.date())
            .fold(None, |acc: Option<(NaiveDate, NaiveDate)>, date| match acc {
                None => Some((date, date)),
                Some((lo, hi)) => Some((lo.min(date), hi.max(date))),
            });
        let Some((earliest, latest)) = bounds else {
            return Vec::new();
        };
        let resolved: Vec<_> = ranges
            .iter()
            .map(|range| range.resolve(earliest, latest))
            .collect();
        candidates
            .into_iter()
            .filter(|entry| {
                entry.title.date().is_some_and(|date| {
                    resolved
                        .iter()
                        .any(|(start, end)| *start <= date && date < *end)
                })
            })
            .collect()
    }

}

pub mod storage {
    //! Entry store over a journal directory.
    //!
    //! Entries come either from the `.cache` written by the last successful re-index
    //! or straight from the `*.journal` files. Derived files (`.cache`, `.tags`) are
    //! only ever written from the `Verified` state.

    use crate::core::{Entry, JournalError, Result};
    use crate::lint::{self, LintError};
    use crate::parser::{bibtex_key, parse_journal_str};
    use crate::query::{self, Query, Selection};
    use chrono::Local;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{BTreeMap, HashSet, btree_map},
        fs,
        io::Write,
        path::{Path, PathBuf},
        time::SystemTime,
    };
    use tracing::{debug, info, warn};

    pub const JOURNAL_EXTENSION: &str = "journal";
    pub const BIBTEX_EXTENSION: &str = "bib";
    pub const CACHE_FILE: &str = ".cache";
    pub const TAGS_FILE: &str = ".tags";
    pub const LOG_FILE: &str = ".log";

    #[derive(Debug, Clone, Default)]
    pub struct LoadOptions {
        /// Read `.cache` when it is present and fresh.
        pub use_cache: bool,
        /// Journal files to leave out.
        pub ignores: Vec<PathBuf>,
    }

    /// Whether the raw files have been checked since loading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum IndexState {
        /// Loaded, not linted.
        Unverified,
        /// Lint found nothing; derived state may be written.
        Verified,
        /// Lint found violations; derived state must not be written.
        Stale,
    }

    /// On-disk layout of `.cache`.
    #[derive(Debug, Serialize, Deserialize)]
    struct CacheFile {
        /// Journal files the cache was built from, relative to the root.
        files: Vec<PathBuf>,
        entries: BTreeMap<String, Entry>,
    }

    #[derive(Debug)]
    pub struct EntryStore {
        root: PathBuf,
        files: Vec<PathBuf>,
        ignores: HashSet<PathBuf>,
        entries: BTreeMap<String, Entry>,
        state: IndexState,
    }

    impl EntryStore {
        pub fn load(directory: &Path, options: &LoadOptions) -> Result<Self> {
            let root = fs::canonicalize(directory).map_err(JournalError::io(directory))?;
            let ignores = canonical_ignores(&options.ignores);
            let files = collect_files(&root, JOURNAL_EXTENSION, &ignores)?;
            debug!(root = %root.display(), files = files.len(), "scanned journal directory");

            let cached = if options.use_cache {
                read_cache(&root, &files)
            } else {
                None
            };
            let entries = match cached {
                Some(entries) => entries,
                None => read_entries(&root, &files)?,
            };
            if entries.is_empty() {
                return Err(JournalError::EmptyStore { directory: root });
            }

            Ok(Self {
                root,
                files,
                ignores,
                entries,
                state: IndexState::Unverified,
            })
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        /// Absolute paths of the journal files, sorted.
        pub fn files(&self) -> &[PathBuf] {
            &self.files
        }

        pub fn state(&self) -> IndexState {
            self.state
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn get(&self, key: &str) -> Option<&Entry> {
            self.entries.get(key)
        }

        /// Entries in title order.
        pub fn entries(&self) -> impl Iterator<Item = &Entry> {
            self.entries.values()
        }

        pub fn filter(&self, query: &Query) -> Selection<'_> {
            query::filter(self.entries.values(), query)
        }

        /// Lint the raw files and record the outcome.
        pub fn verify(&mut self) -> Result<Vec<LintError>> {
            let errors = lint::lint_files(&self.root, &self.files)?;
            self.state = if errors.is_empty() {
                IndexState::Verified
            } else {
                IndexState::Stale
            };
            debug!(state = ?self.state, violations = errors.len(), "verified journal");
            Ok(errors)
        }

        /// Write `.cache` and `.tags`. Only allowed once `verify` came back clean.
        pub fn persist(&self) -> Result<()> {
            if self.state != IndexState::Verified {
                return Err(JournalError::NotVerified);
            }

            let cache_path = self.root.join(CACHE_FILE);
            let cache = CacheFile {
                files: self
                    .files
                    .iter()
                    .map(|path| relative_to(&self.root, path))
                    .collect(),
                entries: self.entries.clone(),
            };
            let json = serde_json::to_string(&cache).map_err(|source| JournalError::Cache {
                path: cache_path.clone(),
                source,
            })?;
            fs::write(&cache_path, json).map_err(JournalError::io(&cache_path))?;

            let tags_path = self.root.join(TAGS_FILE);
            let mut tags = self.tag_lines()?.join("\n");
            tags.push('\n');
            fs::write(&tags_path, tags).map_err(JournalError::io(&tags_path))?;

            info!(entries = self.entries.len(), root = %self.root.display(), "wrote cache and tags");
            Ok(())
        }

        /// Re-index: lint, and when clean rebuild entries from the raw files and
        /// persist them. Returns the violations either way.
        pub fn rebuild_metadata(&mut self) -> Result<Vec<LintError>> {
            let errors = self.verify()?;
            if errors.is_empty() {
                self.entries = read_entries(&self.root, &self.files)?;
                self.persist()?;
            } else {
                warn!(violations = errors.len(), "lint failed; leaving cache and tags untouched");
            }
            Ok(errors)
        }

        /// `key\tpath\tline` for every title and BibTeX key, sorted by key.
        fn tag_lines(&self) -> Result<Vec<String>> {
            let mut tags: BTreeMap<String, (PathBuf, usize)> = self
                .entries
                .values()
                .map(|entry| {
                    (
                        entry.title.key().to_string(),
                        (entry.rel_path.clone(), entry.line_num),
                    )
                })
                .collect();

            for path in collect_files(&self.root, BIBTEX_EXTENSION, &self.ignores)? {
                let text = fs::read_to_string(&path).map_err(JournalError::io(&path))?;
                let rel_path = relative_to(&self.root, &path);
                for (idx, line) in text.lines().enumerate() {
                    if let Some(key) = bibtex_key(line) {
                        tags.entry(key.to_string())
                            .or_insert_with(|| (rel_path.clone(), idx + 1));
                    }
                }
            }

            Ok(tags
                .into_iter()
                .map(|(tag, (path, line))| format!("{tag}\t{}\t{line}", path.display()))
                .collect())
        }
    }

    fn canonical_ignores(ignores: &[PathBuf]) -> HashSet<PathBuf> {
        ignores
            .iter()
            .filter_map(|path| match fs::canonicalize(path) {
                Ok(canonical) => Some(canonical),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unresolvable --ignore path");
                    None
                }
            })
            .collect()
    }

    fn read_entries(root: &Path, files: &[PathBuf]) -> Result<BTreeMap<String, Entry>> {
        let mut entries = BTreeMap::new();
        for path in files {
            let text = fs::read_to_string(path).map_err(JournalError::io(path))?;
            for entry in parse_journal_str(&relative_to(root, path), &text) {
                match entries.entry(entry.title.key().to_string()) {
                    btree_map::Entry::Vacant(slot) => {
                        slot.insert(entry);
                    }
                    btree_map::Entry::Occupied(existing) => warn!(
                        title = %entry.title,
                        first = %existing.get().rel_path.display(),
                        duplicate = %entry.rel_path.display(),
                        "duplicate title; keeping the first"
                    ),
                }
            }
        }
        debug!(entries = entries.len(), "read entries from journal files");
        Ok(entries)
    }

    /// Cached entries, or `None` when the cache is missing, unreadable, built from a
    /// different file set, or older than any journal file.
    fn read_cache(root: &Path, files: &[PathBuf]) -> Option<BTreeMap<String, Entry>> {
        let cache_path = root.join(CACHE_FILE);
        if !root.join(TAGS_FILE).is_file() {
            debug!("no tags file; reading journal files");
            return None;
        }
        let cache_time = modified(&cache_path)?;
        if files
            .iter()
            .any(|path| modified(path).is_none_or(|time| time > cache_time))
        {
            debug!("cache is older than the journal files");
            return None;
        }

        let text = fs::read_to_string(&cache_path).ok()?;
        let cache: CacheFile = match serde_json::from_str(&text) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(path = %cache_path.display(), error = %err, "ignoring unreadable cache");
                return None;
            }
        };
        let current: Vec<PathBuf> = files.iter().map(|path| relative_to(root, path)).collect();
        if cache.files != current {
            debug!("cache was built from a different set of files");
            return None;
        }
        debug!(entries = cache.entries.len(), "loaded entries from cache");
        Some(cache.entries)
    }

    fn modified(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|meta| meta.modified()).ok()
    }

    pub(crate) fn relative_to(root: &Path, path: &Path) -> PathBuf {
        path.strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn is_hidden(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'))
    }

    /// Files with `extension` under `root`, skipping dotfiles, symlinks and `ignores`.
    pub fn collect_files(
        root: &Path,
        extension: &str,
        ignores: &HashSet<PathBuf>,
    ) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        visit_dir(root, extension, ignores, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn visit_dir(
        dir: &Path,
        extension: &str,
        ignores: &HashSet<PathBuf>,
        out: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for entry in fs::read_dir(dir).map_err(JournalError::io(dir))? {
            let entry = entry.map_err(JournalError::io(dir))?;
            let path = entry.path();
            if is_hidden(&path) || ignores.contains(&path) {
                continue;
            }
            let file_type = entry.file_type().map_err(JournalError::io(&path))?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                visit_dir(&path, extension, ignores, out)?;
            } else if file_type.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                out.push(path);
            }
        }
        Ok(())
    }

    /// Append a line to `.log` if, and only if, that file already exists.
    pub fn append_search_log(
        root: &Path,
        operation: &str,
        date_spec: Option<&str>,
        terms: &[String],
    ) -> Result<bool> {
        let path = root.join(LOG_FILE);
        if !path.is_file() {
            return Ok(false);
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(JournalError::io(&path))?;
        writeln!(
            file,
            "{}\t{}\t{}\t{}",
            Local::now().format("%Y-%m-%dT%H:%M:%S"),
            operation,
            date_spec.unwrap_or_default(),
            terms.join(" ")
        )
        .map_err(JournalError::io(&path))?;
        Ok(true)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        const CLEAN_2020: &str = "2020-12-30\n\tquiet day\n\n2020-12-31\n\tnew year's eve\n";
        const CLEAN_2021: &str = "2021-01-01\n\tsaw a movie, referenced [[2020-12-31]]\n";

        fn journal_dir() -> tempfile::TempDir {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(tmp.path().join("2020.journal"), CLEAN_2020).expect("write 2020");
            fs::create_dir_all(tmp.path().join("sub")).expect("mkdir sub");
            fs::write(tmp.path().join("sub/2021.journal"), CLEAN_2021).expect("write 2021");
            tmp
        }

        fn uncached() -> LoadOptions {
            LoadOptions::default()
        }

        fn cached() -> LoadOptions {
            LoadOptions {
                use_cache: true,
                ..LoadOptions::default()
            }
        }

        #[test]
        fn load_walks_nested_journal_files() {
            let tmp = journal_dir();
            fs::write(tmp.path().join("notes.txt"), "2019-01-01\n\tnot a journal\n").unwrap();
            fs::write(tmp.path().join(".hidden.journal"), "2019-01-02\n\thidden\n").unwrap();

            let store = EntryStore::load(tmp.path(), &uncached()).expect("load");
            let keys: Vec<_> = store.entries().map(|e| e.title.key()).collect();
            assert_eq!(keys, ["2020-12-30", "2020-12-31", "2021-01-01"]);

            let eve = store.get("2020-12-31").expect("eve");
            assert_eq!(eve.rel_path, PathBuf::from("2020.journal"));
            assert_eq!(eve.line_num, 4);
            assert_eq!(eve.text, "2020-12-31\n\tnew year's eve");
            assert_eq!(
                store.get("2021-01-01").expect("new year").rel_path,
                PathBuf::from("sub/2021.journal")
            );
            assert_eq!(store.state(), IndexState::Unverified);
        }

        #[test]
        fn empty_directory_is_an_error() {
            let tmp = tempfile::tempdir().unwrap();
            let err = EntryStore::load(tmp.path(), &uncached()).unwrap_err();
            assert!(matches!(err, JournalError::EmptyStore { .. }));
        }

        #[test]
        fn missing_directory_is_an_io_error() {
            let tmp = tempfile::tempdir().unwrap();
            let err = EntryStore::load(&tmp.path().join("nope"), &uncached()).unwrap_err();
            assert!(matches!(err, JournalError::Io { .. }));
        }

        #[test]
        fn ignored_files_are_skipped() {
            let tmp = journal_dir();
            let options = LoadOptions {
                use_cache: false,
                ignores: vec![tmp.path().join("sub/2021.journal")],
            };
            let store = EntryStore::load(tmp.path(), &options).unwrap();
            assert_eq!(store.len(), 2);
            assert!(store.get("2021-01-01").is_none());
        }

        #[test]
        fn cache_round_trips_entry_text() {
            let tmp = journal_dir();
            let mut store = EntryStore::load(tmp.path(), &uncached()).unwrap();
            let errors = store.rebuild_metadata().unwrap();
            assert!(errors.is_empty(), "{errors:?}");
            assert_eq!(store.state(), IndexState::Verified);
            assert!(tmp.path().join(CACHE_FILE).is_file());
            assert!(tmp.path().join(TAGS_FILE).is_file());

            let direct = EntryStore::load(tmp.path(), &uncached()).unwrap();
            let from_cache = EntryStore::load(tmp.path(), &cached()).unwrap();
            let direct: Vec<_> = direct.entries().cloned().collect();
            let from_cache: Vec<_> = from_cache.entries().cloned().collect();
            assert_eq!(direct, from_cache);
        }

        #[test]
        fn cache_from_a_different_file_set_is_ignored() {
            let tmp = journal_dir();
            let mut store = EntryStore::load(tmp.path(), &uncached()).unwrap();
            assert!(store.rebuild_metadata().unwrap().is_empty());

            fs::write(tmp.path().join("2022.journal"), "2022-01-01\n\tlater\n").unwrap();
            let store = EntryStore::load(tmp.path(), &cached()).unwrap();
            assert!(store.get("2022-01-01").is_some());
        }

        #[test]
        fn unreadable_cache_falls_back_to_files() {
            let tmp = journal_dir();
            let mut store = EntryStore::load(tmp.path(), &uncached()).unwrap();
            assert!(store.rebuild_metadata().unwrap().is_empty());
            fs::write(tmp.path().join(CACHE_FILE), "{ not json").unwrap();

            let store = EntryStore::load(tmp.path(), &cached()).unwrap();
            assert_eq!(store.len(), 3);
        }

        #[test]
        fn lint_failures_block_persisting() {
            let tmp = journal_dir();
            fs::write(tmp.path().join("bad.journal"), "Ideas\n\tone  two\n").unwrap();

            let mut store = EntryStore::load(tmp.path(), &uncached()).unwrap();
            let errors = store.rebuild_metadata().unwrap();
            assert_eq!(errors.len(), 1);
            assert_eq!(store.state(), IndexState::Stale);
            assert!(!tmp.path().join(CACHE_FILE).exists());
            assert!(!tmp.path().join(TAGS_FILE).exists());
            assert!(matches!(store.persist(), Err(JournalError::NotVerified)));
        }

        #[test]
        fn persisting_requires_verification() {
            let tmp = journal_dir();
            let store = EntryStore::load(tmp.path(), &uncached()).unwrap();
            assert!(matches!(store.persist(), Err(JournalError::NotVerified)));
        }

        #[test]
        fn tags_cover_titles_and_bibtex_keys() {
            let tmp = journal_dir();
            fs::write(
                tmp.path().join("refs.bib"),
                "@article{smith2020,\n\ttitle = {On Things},\n}\n",
            )
            .unwrap();
            let mut store = EntryStore::load(tmp.path(), &uncached()).unwrap();
            assert!(store.rebuild_metadata().unwrap().is_empty());

            let tags = fs::read_to_string(tmp.path().join(TAGS_FILE)).unwrap();
            assert_eq!(
                tags,
                "2020-12-30\t2020.journal\t1\n\
                 2020-12-31\t2020.journal\t4\n\
                 2021-01-01\tsub/2021.journal\t1\n\
                 smith2020\trefs.bib\t1\n"
            );
        }

        #[test]
        fn search_log_is_only_appended_when_present() {
            let tmp = journal_dir();
            let terms = vec!["movie".to_string()];
            assert!(!append_search_log(tmp.path(), "list", None, &terms).unwrap());
            assert!(!tmp.path().join(LOG_FILE).exists());

            fs::write(tmp.path().join(LOG_FILE), "").unwrap();
            assert!(append_search_log(tmp.path(), "list", Some("2020"), &terms).unwrap());
            let log = fs::read_to_string(tmp.path().join(LOG_FILE)).unwrap();
            assert!(log.ends_with("\tlist\t2020\tmovie\n"), "{log:?}");
        }
    }
}

pub mod lint {
    //! Line-by-line formatting checks over the raw journal files.

    use crate::core::{JournalError, Result, Title};
    use crate::parser::{
        has_impossible_date, looks_like_date, parse_partial_date, parse_title_line,
    };
    use crate::storage::relative_to;
    use std::{
        collections::{HashMap, hash_map},
        fmt, fs,
        path::{Path, PathBuf},
    };

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct LintError {
        pub path: PathBuf,
        pub line: usize,
        pub message: String,
    }

    impl fmt::Display for LintError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}: {}", self.path.display(), self.line, self.message)
        }
    }

    /// Title key -> where it was first seen.
    pub type SeenTitles = HashMap<String, (PathBuf, usize)>;

    /// Lint every file; violations sorted by `(path, line)`.
    pub fn lint_files(root: &Path, files: &[PathBuf]) -> Result<Vec<LintError>> {
        let mut files = files.to_vec();
        files.sort();
        let mut seen = SeenTitles::new();
        let mut errors = Vec::new();
        for path in &files {
            let bytes = fs::read(path).map_err(JournalError::io(path))?;
            let rel_path = relative_to(root, path);
            match String::from_utf8(bytes) {
                Ok(text) => errors.extend(lint_str(&rel_path, &text, &mut seen)),
                Err(err) => {
                    let text = String::from_utf8_lossy(err.as_bytes()).into_owned();
                    errors.push(LintError {
                        path: rel_path.clone(),
                        line: 1,
                        message: "file is not valid UTF-8".into(),
                    });
                    errors.extend(lint_str(&rel_path, &text, &mut seen));
                }
            }
        }
        errors.sort();
        Ok(errors)
    }

    struct Linter<'a> {
        path: &'a Path,
        errors: Vec<LintError>,
        /// Whether this file writes dates as `YYYY-MM-DD, Weekday`.
        long_form: Option<bool>,
        /// Prefix every title must carry when the file is named after a period.
        stem: Option<String>,
    }

    impl Linter<'_> {
        fn report(&mut self, line: usize, message: impl Into<String>) {
            self.errors.push(LintError {
                path: self.path.to_path_buf(),
                line,
                message: message.into(),
            });
        }

        fn check_title(&mut self, num: usize, line: &str, seen: &mut SeenTitles) {
            let title: Title = parse_title_line(line);
            if title.is_date() {
                if !title.weekday_matches() {
                    self.report(num, "weekday does not match date");
                }
                let long = title.is_long_form();
                match self.long_form {
                    None => self.long_form = Some(long),
                    Some(expected) if expected != long => {
                        self.report(num, "inconsistent date format")
                    }
                    Some(_) => {}
                }
            } else if has_impossible_date(line) {
                self.report(num, "invalid date");
            } else if looks_like_date(line) {
                self.report(num, "malformed date title");
            }

            if let Some(stem) = &self.stem {
                if !line.starts_with(stem.as_str()) {
                    self.report(num, "title does not match file name");
                }
            }

            // a malformed date title still claims its date
            let key = if !title.is_date() && looks_like_date(line) && !has_impossible_date(line) {
                &line[..10]
            } else {
                title.key()
            };
            match seen.entry(key.to_string()) {
                hash_map::Entry::Occupied(first) => {
                    let (path, first_line) = first.get();
                    let message = format!(
                        "duplicate title (first seen at {}:{})",
                        path.display(),
                        first_line
                    );
                    self.report(num, message);
                }
                hash_map::Entry::Vacant(slot) => {
                    slot.insert((self.path.to_path_buf(), num));
                }
            }
        }
    }

    /// File stem that names a period (`2021`, `2021-03`).
    fn period_stem(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        parse_partial_date(stem)?.first_day()?;
        Some(stem.to_string())
    }

    fn is_blank(line: &str) -> bool {
        line.trim().is_empty()
    }

    fn is_printable(c: char) -> bool {
        c == '\t' || (' '..='~').contains(&c)
    }

    /// Lint one file's text. `seen` carries titles across files for duplicate checks.
    pub fn lint_str(path: &Path, text: &str, seen: &mut SeenTitles) -> Vec<LintError> {
        let mut linter = Linter {
            path,
            errors: Vec::new(),
            long_form: None,
            stem: period_stem(path),
        };

        let text = match text.strip_prefix('\u{feff}') {
            Some(rest) => {
                linter.report(1, "byte-order mark at start of file");
                rest
            }
            None => text,
        };
        if text.is_empty() {
            linter.report(1, "empty file");
            return linter.errors;
        }

        let mut lines: Vec<&str> = text.split('\n').collect();
        // a final newline terminates the last line
        if lines.len() > 1 && lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        if lines.first().is_some_and(|line| is_blank(line)) {
            linter.report(1, "blank line at start of file");
        }
        if lines.len() > 1 && lines.last().is_some_and(|line| is_blank(line)) {
            linter.report(lines.len(), "blank line at end of file");
        }

        let mut prev_depth = 0usize;
        let mut prev_unindented = false;
        let mut blank_run = 0usize;
        let mut seen_entry = false;

        for (idx, line) in lines.iter().enumerate() {
            let num = idx + 1;
            if is_blank(line) {
                if !line.is_empty() {
                    linter.report(num, "trailing whitespace");
                }
                blank_run += 1;
                prev_depth = 0;
                prev_unindented = false;
                continue;
            }

            let body = line.trim_start_matches([' ', '\t']);
            let indent = &line[..line.len() - body.len()];
            if indent.contains(' ') {
                linter.report(num, "non-tab indentation");
            }
            let tabs = indent.chars().filter(|&c| c == '\t').count();
            let depth = if indent.is_empty() { 0 } else { tabs.max(1) };

            if depth > prev_depth + 1 {
                linter.report(num, "indentation increased by more than one level");
            }
            if !line.chars().all(is_printable) {
                linter.report(num, "non-printable or non-ASCII character");
            }
            if line.ends_with(char::is_whitespace) {
                linter.report(num, "trailing whitespace");
            }
            if !body.starts_with('|') && body.trim_end().contains("  ") {
                linter.report(num, "multiple consecutive spaces");
            }

            if depth == 0 {
                if prev_unindented {
                    linter.report(num, "consecutive unindented lines");
                } else {
                    if seen_entry && blank_run == 0 {
                        linter.report(num, "no blank line between entries");
                    } else if seen_entry && blank_run > 1 {
                        linter.report(num, "multiple blank lines between entries");
                    }
                    seen_entry = true;
                    linter.check_title(num, line, seen);
                }
                prev_unindented = true;
            } else {
                if blank_run > 0 || !seen_entry {
                    linter.report(num, "indented line without a title");
                }
                if body.matches('"').count() % 2 == 1 {
                    linter.report(num, "unbalanced quotes");
                }
                prev_unindented = false;
            }

            blank_run = 0;
            prev_depth = depth;
        }

        linter.errors.sort();
        linter.errors
    }

}

/* ---------------------------------------------------------------------------- */
/* Projectors: selection -> derived views                                        */
/* ---------------------------------------------------------------------------- */

pub mod projectors {
    pub mod count_projector {
        //! Per-period statistics over a selection.

        use crate::core::{Entry, TimeUnit};
        use crate::parser::parse_partial_date;
        use crate::query::Selection;
        use chrono::NaiveDate;
        use indexmap::IndexMap;
        use std::collections::BTreeMap;

        /// Group holding free-text titles.
        pub const OTHER_GROUP: &str = "other";
        /// Group holding the whole selection.
        pub const ALL_GROUP: &str = "all";

        #[derive(Debug, Clone, PartialEq)]
        pub struct Summary {
            pub key: String,
            pub posts: usize,
            pub words: usize,
            pub size: usize,
            pub min: usize,
            pub median: f64,
            pub max: usize,
            pub mean: f64,
            pub stdev: f64,
            /// Days per post; undefined for groups without dates.
            pub frequency: Option<f64>,
        }

        /// Date groups in key order (reversed when asked), then `other`, then `all`.
        pub fn group<'a>(
            selection: &Selection<'a>,
            unit: TimeUnit,
            reverse: bool,
        ) -> IndexMap<String, Vec<&'a Entry>> {
            let mut dated: BTreeMap<&'a str, Vec<&'a Entry>> = BTreeMap::new();
            let mut other = Vec::new();
            for &entry in selection.values() {
                match entry.title.iso(unit) {
                    Some(prefix) => dated.entry(prefix).or_default().push(entry),
                    None => other.push(entry),
                }
            }

            let mut dated: Vec<_> = dated.into_iter().collect();
            if reverse {
                dated.reverse();
            }
            let mut groups: IndexMap<String, Vec<&'a Entry>> = dated
                .into_iter()
                .map(|(key, entries)| (key.to_string(), entries))
                .collect();
            if !other.is_empty() {
                groups.insert(OTHER_GROUP.to_string(), other);
            }
            groups.insert(ALL_GROUP.to_string(), selection.values().copied().collect());
            groups
        }

        /// First and last selected dates.
        pub fn date_bounds(selection: &Selection<'_>) -> Option<(NaiveDate, NaiveDate)> {
            let mut dates = selection.values().filter_map(|entry| entry.title.date());
            let first = dates.next()?;
            Some(dates.fold((first, first), |(lo, hi), date| (lo.min(date), hi.max(date))))
        }

        /// Days covered by a group: its period clipped to the selection's bounds.
        fn group_span(key: &str, bounds: Option<(NaiveDate, NaiveDate)>) -> Option<i64> {
            let (first, last) = bounds?;
            if key == ALL_GROUP {
                return Some((last - first).num_days());
            }
            let period = parse_partial_date(key)?;
            let start = period.first_day()?.max(first);
            let end = period.last_day()?.min(last);
            Some((end - start).num_days().max(0))
        }

        pub fn summarize(key: &str, entries: &[&Entry], span_days: Option<i64>) -> Summary {
            let mut words: Vec<usize> = entries.iter().map(|entry| entry.words()).collect();
            words.sort_unstable();
            let posts = words.len();
            let total: usize = words.iter().sum();
            let mean = if posts == 0 { 0.0 } else { total as f64 / posts as f64 };
            let median = match posts {
                0 => 0.0,
                n if n % 2 == 1 => words[n / 2] as f64,
                n => (words[n / 2 - 1] + words[n / 2]) as f64 / 2.0,
            };
            let stdev = if posts <= 1 {
                0.0
            } else {
                let variance = words
                    .iter()
                    .map(|&w| (w as f64 - mean).powi(2))
                    .sum::<f64>()
                    / posts as f64;
                variance.sqrt()
            };

            Summary {
                key: key.to_string(),
                posts,
                words: total,
                size: entries.iter().map(|entry| entry.size()).sum(),
                min: words.first().copied().unwrap_or_default(),
                median,
                max: words.last().copied().unwrap_or_default(),
                mean,
                stdev,
                frequency: span_days
                    .filter(|_| posts > 0)
                    .map(|days| (days + 1) as f64 / posts as f64),
            }
        }

        pub fn count(selection: &Selection<'_>, unit: TimeUnit, reverse: bool) -> Vec<Summary> {
            let bounds = date_bounds(selection);
            group(selection, unit, reverse)
                .iter()
                .map(|(key, entries)| summarize(key, entries, group_span(key, bounds)))
                .collect()
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::core::Title;
            use std::path::PathBuf;

            fn entry(title: &str, body: &str) -> Entry {
                Entry {
                    title: Title::new(title),
                    rel_path: PathBuf::from("test.journal"),
                    line_num: 1,
                    text: format!("{title}\n\t{body}"),
                }
            }

            fn select(entries: &[Entry]) -> Selection<'_> {
                entries.iter().map(|e| (e.title.key(), e)).collect()
            }

            #[test]
            fn yearly_rows_then_all() {
                let entries = vec![
                    entry("2020-12-31", "quiet day"),
                    entry("2021-01-01", "saw a movie, referenced [[2020-12-31]]"),
                ];
                let rows = count(&select(&entries), TimeUnit::Year, false);
                let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
                assert_eq!(keys, ["2020", "2021", "all"]);

                let all = &rows[2];
                assert_eq!(all.posts, 2);
                assert_eq!(all.words, 3 + 6);
                assert_eq!((all.min, all.max), (3, 6));
                assert_eq!(all.median, 4.5);
                assert_eq!(all.mean, 4.5);
                assert_eq!(all.stdev, 1.5);
                assert_eq!(all.frequency, Some(1.0));

                // 2020 is clipped to its only selected day
                assert_eq!(rows[0].frequency, Some(1.0));
                assert_eq!(rows[0].size, "2020-12-31\n\tquiet day".chars().count());
            }

            #[test]
            fn reverse_orders_date_groups_only() {
                let entries = vec![
                    entry("2020-01-01", "a"),
                    entry("2020-03-01", "b"),
                    entry("Ideas", "c"),
                ];
                let rows = count(&select(&entries), TimeUnit::Month, true);
                let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
                assert_eq!(keys, ["2020-03", "2020-01", OTHER_GROUP, ALL_GROUP]);
                assert_eq!(rows[2].frequency, None);
                assert_eq!(rows[3].posts, 3);
            }

            #[test]
            fn frequency_spans_the_clipped_period() {
                let entries = vec![
                    entry("2020-01-10", "a"),
                    entry("2020-01-20", "b"),
                    entry("2020-02-05", "c"),
                ];
                let rows = count(&select(&entries), TimeUnit::Month, false);
                // January runs from the 10th to the 31st: 22 days over 2 posts
                assert_eq!(rows[0].frequency, Some(11.0));
                // February runs from the 1st to the 5th
                assert_eq!(rows[1].frequency, Some(5.0));
                // the 10th of January to the 5th of February
                assert_eq!(rows[2].frequency, Some(27.0 / 3.0));
            }

            #[test]
            fn odd_median_and_population_stdev() {
                let entries = vec![
                    entry("2020-01-01", "one"),
                    entry("2020-01-02", "one two three"),
                    entry("2020-01-03", "one two three four five six seven"),
                ];
                let refs: Vec<&Entry> = entries.iter().collect();
                let summary = summarize("x", &refs, None);
                // word counts include the title: 2, 4, 8
                assert_eq!(summary.median, 4.0);
                assert!((summary.mean - 14.0 / 3.0).abs() < 1e-9);
                assert!((summary.stdev - (56.0f64 / 9.0).sqrt()).abs() < 1e-9);
                assert_eq!(summary.frequency, None);
            }

            #[test]
            fn single_post_has_zero_stdev() {
                let entries = vec![entry("Ideas", "a b c")];
                let rows = count(&select(&entries), TimeUnit::Day, false);
                let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
                assert_eq!(keys, [OTHER_GROUP, ALL_GROUP]);
                assert_eq!(rows[1].stdev, 0.0);
                assert_eq!(rows[1].frequency, None);
            }
        }
    }

    pub mod graph_projector {
        //! Back-reference graph between date-titled entries.
        //!
        //! Entries may only cite earlier titles, so the graph is a DAG by construction
        //! and components can be merged with a plain union-find.

        use crate::core::{Entry, TimeUnit};
        use crate::query::Selection;
        use regex::Regex;
        use std::{
            collections::{BTreeMap, BTreeSet, HashMap},
            fmt::Write,
            sync::LazyLock,
        };

        static REFERENCE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("reference pattern"));

        pub const UNIFORM_FONT_SIZE: f64 = 14.0;
        pub const MIN_FONT_SIZE: f64 = 8.0;

        /// Date-shaped substrings of `text`.
        pub fn references(text: &str) -> impl Iterator<Item = &str> {
            REFERENCE.find_iter(text).map(|m| m.as_str())
        }

        /// Union-find over dense ids.
        #[derive(Debug, Clone)]
        pub struct DisjointSet {
            parent: Vec<usize>,
            rank: Vec<u8>,
        }

        impl DisjointSet {
            pub fn new(len: usize) -> Self {
                Self {
                    parent: (0..len).collect(),
                    rank: vec![0; len],
                }
            }

            pub fn find(&mut self, id: usize) -> usize {
                let mut root = id;
                while self.parent[root] != root {
                    root = self.parent[root];
                }
                let mut cur = id;
                while self.parent[cur] != root {
                    let next = self.parent[cur];
                    self.parent[cur] = root;
                    cur = next;
                }
                root
            }

            /// Merge the sets holding `a` and `b`; returns the new root.
            pub fn union(&mut self, a: usize, b: usize) -> usize {
                let (ra, rb) = (self.find(a), self.find(b));
                if ra == rb {
                    return ra;
                }
                match self.rank[ra].cmp(&self.rank[rb]) {
                    std::cmp::Ordering::Less => {
                        self.parent[ra] = rb;
                        rb
                    }
                    std::cmp::Ordering::Greater => {
                        self.parent[rb] = ra;
                        ra
                    }
                    std::cmp::Ordering::Equal => {
                        self.parent[rb] = ra;
                        self.rank[ra] += 1;
                        ra
                    }
                }
            }
        }

        #[derive(Debug, Clone, Copy)]
        pub struct GraphOptions {
            /// Skip edges already implied by a transitive path.
            pub simplify: bool,
        }

        impl Default for GraphOptions {
            fn default() -> Self {
                Self { simplify: true }
            }
        }

        /// How node labels are scaled.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
        pub enum NodeSize {
            #[default]
            Uniform,
            /// Word count of the entry.
            Length,
            /// Number of entries citing it.
            Inbound,
            /// Number of dates it mentions.
            References,
        }

        #[derive(Debug)]
        pub struct ReferenceGraph<'a> {
            nodes: Vec<&'a Entry>,
            /// `(src, dest)` node ids; `dest < src` always.
            edges: BTreeSet<(usize, usize)>,
            /// Direct citations of each node, before simplification.
            inbound: Vec<usize>,
            components: Vec<Vec<usize>>,
            component_of: Vec<usize>,
        }

        impl<'a> ReferenceGraph<'a> {
            pub fn build(selection: &Selection<'a>, options: GraphOptions) -> Self {
                let nodes: Vec<&'a Entry> = selection
                    .values()
                    .copied()
                    .filter(|entry| entry.title.is_date())
                    .collect();
                let index: HashMap<&str, usize> = nodes
                    .iter()
                    .enumerate()
                    .map(|(id, entry)| (entry.title.key(), id))
                    .collect();

                let mut edges = BTreeSet::new();
                let mut inbound = vec![0; nodes.len()];
                let mut referents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
                let mut sets = DisjointSet::new(nodes.len());

                for (src, entry) in nodes.iter().enumerate() {
                    let key = entry.title.key();
                    let dests: BTreeSet<usize> = references(&entry.text)
                        .filter(|reference| *reference < key)
                        .filter_map(|reference| index.get(reference).copied())
                        .collect();

                    let (earlier, rest) = referents.split_at_mut(src);
                    let reachable = &mut rest[0];
                    for dest in dests.into_iter().rev() {
                        inbound[dest] += 1;
                        if options.simplify && reachable.contains(&dest) {
                            continue;
                        }
                        edges.insert((src, dest));
                        sets.union(src, dest);
                        reachable.insert(dest);
                        reachable.extend(earlier[dest].iter().copied());
                    }
                }

                let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for id in 0..nodes.len() {
                    grouped.entry(sets.find(id)).or_default().push(id);
                }
                let mut components: Vec<Vec<usize>> = grouped.into_values().collect();
                components.sort_by(|a, b| (b.len(), b[0]).cmp(&(a.len(), a[0])));

                let mut component_of = vec![0; nodes.len()];
                for (idx, component) in components.iter().enumerate() {
                    for &id in component {
                        component_of[id] = idx;
                    }
                }

                Self {
                    nodes,
                    edges,
                    inbound,
                    components,
                    component_of,
                }
            }

            pub fn nodes(&self) -> &[&'a Entry] {
                &self.nodes
            }

            /// Drawn edges as `(src, dest)` title keys, sorted.
            pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
                self.edges
                    .iter()
                    .map(|&(src, dest)| (self.key(src), self.key(dest)))
            }

            pub fn edge_count(&self) -> usize {
                self.edges.len()
            }

            pub fn inbound(&self, key: &str) -> usize {
                self.nodes
                    .iter()
                    .position(|entry| entry.title.key() == key)
                    .map_or(0, |id| self.inbound[id])
            }

            /// Components as title keys, largest first; singletons included.
            pub fn components(&self) -> Vec<Vec<&str>> {
                self.components
                    .iter()
                    .map(|component| component.iter().map(|&id| self.key(id)).collect())
                    .collect()
            }

            fn key(&self, id: usize) -> &str {
                self.nodes[id].title.key()
            }

            pub fn font_size(&self, id: usize, node_size: NodeSize) -> f64 {
                let entry = self.nodes[id];
                let scaled = match node_size {
                    NodeSize::Uniform => return UNIFORM_FONT_SIZE,
                    NodeSize::Length => entry.words() as f64 / 25.0,
                    NodeSize::Inbound => self.inbound[id] as f64 * 8.0,
                    NodeSize::References => {
                        references(&entry.text)
                            .filter(|reference| *reference != entry.title.key())
                            .count() as f64
                            * 4.0
                    }
                };
                scaled.max(MIN_FONT_SIZE)
            }
        }

        /// Graphviz DOT for every component that has at least one edge.
        pub fn render_dot(graph: &ReferenceGraph<'_>, node_size: NodeSize) -> String {
            let mut out = String::new();
            out.push_str("digraph {\n");
            out.push_str("\tgraph [size=\"48\", model=\"subset\", rankdir=\"BT\"];\n");
            out.push_str("\tnode [fontcolor=\"#3465A4\", shape=\"none\"];\n");
            out.push_str("\tedge [color=\"#888A85\"];\n");

            let mut by_component: Vec<Vec<(usize, usize)>> = vec![Vec::new(); graph.components.len()];
            for &(src, dest) in &graph.edges {
                by_component[graph.component_of[src]].push((src, dest));
            }

            for (component, edges) in graph.components.iter().zip(&by_component) {
                if edges.is_empty() {
                    continue;
                }
                let first = graph.key(component[0]);
                let last = graph.key(component[component.len() - 1]);
                let _ = writeln!(
                    out,
                    "\n\t// {} entries, {} to {}",
                    component.len(),
                    first,
                    last
                );

                let mut months: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
                for &id in component {
                    let month = graph.nodes[id].title.iso(TimeUnit::Month).unwrap_or_default();
                    months.entry(month).or_default().push(id);
                }
                for ids in months.values() {
                    out.push_str("\t{ rank=\"same\";");
                    for &id in ids {
                        let _ = write!(
                            out,
                            " \"{}\" [fontsize=\"{:.2}\"];",
                            graph.key(id),
                            graph.font_size(id, node_size)
                        );
                    }
                    out.push_str(" }\n");
                }
                for &(src, dest) in edges {
                    let _ = writeln!(out, "\t\"{}\" -> \"{}\";", graph.key(src), graph.key(dest));
                }
            }
            out.push_str("}\n");
            out
        }

    }
}

pub mod format {
    //! Terminal rendering of selections and statistics.

    use crate::core::{Entry, TimeUnit};
    use crate::projectors::count_projector::Summary;

    /// `1234567` -> `1,234,567`.
    pub fn format_thousands(n: usize) -> String {
        let digits = n.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (idx, c) in digits.chars().enumerate() {
            if idx > 0 && (digits.len() - idx) % 3 == 0 {
                out.push(',');
            }
            out.push(c);
        }
        out
    }

    /// Entry texts separated by blank lines.
    pub fn format_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> String {
        entries
            .into_iter()
            .map(|entry| entry.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn count_cells(row: &Summary) -> Vec<String> {
        vec![
            row.key.clone(),
            row.posts.to_string(),
            format_thousands(row.words),
            format_thousands(row.size),
            row.min.to_string(),
            format!("{:.1}", row.median),
            row.max.to_string(),
            format!("{:.1}", row.mean),
            format!("{:.1}", row.stdev),
            row.frequency
                .map_or_else(|| "-".to_string(), |freq| format!("{freq:.3}")),
        ]
    }

    /// Column-aligned statistics table; one line per row, newline-terminated.
    pub fn format_count_table(unit: TimeUnit, rows: &[Summary]) -> String {
        let header = [
            unit.label(),
            "posts",
            "words",
            "size",
            "min",
            "med",
            "max",
            "mean",
            "stdev",
            "freq",
        ];
        let cells: Vec<Vec<String>> = rows.iter().map(count_cells).collect();
        let widths: Vec<usize> = header
            .iter()
            .enumerate()
            .map(|(col, title)| {
                cells
                    .iter()
                    .map(|row| row[col].len())
                    .chain([title.len()])
                    .max()
                    .unwrap_or_default()
            })
            .collect();

        let mut lines = Vec::with_capacity(rows.len() + 2);
        lines.push(
            header
                .iter()
                .zip(&widths)
                .map(|(title, &width)| format!("{:^width$}", title.to_uppercase()))
                .collect::<Vec<_>>()
                .join("  "),
        );
        lines.push(
            widths
                .iter()
                .map(|&width| "-".repeat(width))
                .collect::<Vec<_>>()
                .join("  "),
        );
        for row in &cells {
            lines.push(
                row.iter()
                    .zip(&widths)
                    .map(|(cell, &width)| format!("{cell:>width$}"))
                    .collect::<Vec<_>>()
                    .join("  "),
            );
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn summary(key: &str, words: usize, frequency: Option<f64>) -> Summary {
            Summary {
                key: key.to_string(),
                posts: 1,
                words,
                size: words * 6,
                min: words,
                median: words as f64,
                max: words,
                mean: words as f64,
                stdev: 0.0,
                frequency,
            }
        }

        #[test]
        fn thousands() {
            assert_eq!(format_thousands(0), "0");
            assert_eq!(format_thousands(999), "999");
            assert_eq!(format_thousands(1000), "1,000");
            assert_eq!(format_thousands(1234567), "1,234,567");
        }

        #[test]
        fn table_layout() {
            let rows = [
                summary("2020", 1234, Some(1.0)),
                summary("other", 5, None),
            ];
            let table = format_count_table(TimeUnit::Year, &rows);
            let lines: Vec<&str> = table.lines().collect();
            assert_eq!(lines.len(), 4);
            assert_eq!(
                lines[0],
                "YEAR   POSTS  WORDS  SIZE   MIN    MED    MAX    MEAN   STDEV  FREQ "
            );
            assert!(lines[1].chars().all(|c| c == '-' || c == ' '));
            assert_eq!(
                lines[2],
                " 2020      1  1,234  7,404  1234  1234.0  1234  1234.0    0.0  1.000"
            );
            assert!(lines[3].starts_with("other"));
            assert!(lines[3].ends_with("    -"));
            assert!(table.ends_with('\n'));
        }

        #[test]
        fn entries_are_blank_line_separated() {
            use crate::core::Title;
            use std::path::PathBuf;
            let make = |title: &str| Entry {
                title: Title::new(title),
                rel_path: PathBuf::from("x.journal"),
                line_num: 1,
                text: format!("{title}\n\tbody"),
            };
            let entries = [make("2020-01-01"), make("2020-01-02")];
            assert_eq!(
                format_entries(&entries),
                "2020-01-01\n\tbody\n\n2020-01-02\n\tbody"
            );
        }
    }
}

pub use crate::core::{Entry, JournalError, TimeUnit, Title};
pub use crate::query::{DateSpec, Query, QueryOptions, Selection};
pub use crate::storage::{EntryStore, IndexState, LoadOptions};
