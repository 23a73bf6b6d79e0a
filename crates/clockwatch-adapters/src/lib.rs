//! Report adapters: typed parsing of chrony and timedatectl text output.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use clockwatch_core::{
    normalize_label, ClientRow, FieldMap, FieldValue, Record, RecordCategory, CLIENTS_FIELD,
};
use regex::Regex;
use tracing::warn;

pub const CRATE_NAME: &str = "clockwatch-adapters";

static NUMERIC_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[-+]?[0-9]*\.[0-9]+|[0-9]+").expect("numeric literal pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Integer(i64),
    Decimal(f64),
}

impl From<Numeric> for FieldValue {
    fn from(value: Numeric) -> Self {
        match value {
            Numeric::Integer(v) => FieldValue::Integer(v),
            Numeric::Decimal(v) => FieldValue::Decimal(v),
        }
    }
}

/// First numeric literal in `text`, if any.
///
/// A literal containing `.` is read as a decimal, anything else as an integer.
/// Only decimals carry a sign: `-12` yields `12`.
/// Literals that do not convert (an integer overflowing `i64`) yield `None`.
pub fn extract_numeric(text: &str) -> Option<Numeric> {
    let literal = NUMERIC_LITERAL.find(text)?.as_str();
    if literal.contains('.') {
        literal.parse::<f64>().ok().map(Numeric::Decimal)
    } else {
        literal.parse::<i64>().ok().map(Numeric::Integer)
    }
}

const CTIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";
const WEEKDAY_ISO_FORMAT: &str = "%a %Y-%m-%d %H:%M:%S";
const CTIME_DATE_FORMAT: &str = "%b %d %H:%M:%S %Y";
const ISO_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const UTC_ZONE_NAMES: [&str; 3] = ["UTC", "GMT", "Z"];

/// Date/time shapes printed by chronyc and timedatectl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampLayout {
    /// `Wed Jul 09 06:23:55 2025`, read as UTC.
    CtimeUtc,
    /// `Wed 2025-07-09 06:23:55 UTC`
    ZoneName,
    /// `Wed 2025-07-09 13:23:55 +07`; also `+0700` and `+07:00`.
    NumericOffset,
    /// `Wed 2025-07-09 06:23:55`, read as UTC.
    Naive,
}

impl TimestampLayout {
    /// Zone-bearing layouts come before the bare one so a trailing zone is never ignored.
    pub const DEFAULT_ORDER: [TimestampLayout; 4] = [
        TimestampLayout::CtimeUtc,
        TimestampLayout::ZoneName,
        TimestampLayout::NumericOffset,
        TimestampLayout::Naive,
    ];

    pub fn parse(self, text: &str) -> Option<DateTime<Utc>> {
        let text = text.trim();
        match self {
            TimestampLayout::CtimeUtc => {
                NaiveDateTime::parse_from_str(strip_weekday(text)?, CTIME_DATE_FORMAT)
                    .ok()
                    .map(|naive| naive.and_utc())
            }
            TimestampLayout::ZoneName => {
                let (wall, zone) = text.rsplit_once(' ')?;
                if !UTC_ZONE_NAMES.iter().any(|name| name.eq_ignore_ascii_case(zone)) {
                    return None;
                }
                parse_weekday_iso(wall)
            }
            TimestampLayout::NumericOffset => {
                let (wall, offset) = text.rsplit_once(' ')?;
                let offset = parse_numeric_offset(offset)?;
                let wall = strip_weekday(wall.trim_end())?;
                let naive = NaiveDateTime::parse_from_str(wall, ISO_FORMAT).ok()?;
                offset
                    .from_local_datetime(&naive)
                    .single()
                    .map(|ts| ts.with_timezone(&Utc))
            }
            TimestampLayout::Naive => parse_weekday_iso(text),
        }
    }

    pub fn format(self, ts: DateTime<Utc>) -> String {
        match self {
            TimestampLayout::CtimeUtc => ts.format(CTIME_FORMAT).to_string(),
            TimestampLayout::ZoneName => format!("{} UTC", ts.format(WEEKDAY_ISO_FORMAT)),
            TimestampLayout::NumericOffset => ts.format("%a %Y-%m-%d %H:%M:%S %z").to_string(),
            TimestampLayout::Naive => ts.format(WEEKDAY_ISO_FORMAT).to_string(),
        }
    }
}

/// Drop the leading day-name token. The date alone decides the instant, so a
/// day name that disagrees with it is ignored.
fn strip_weekday(text: &str) -> Option<&str> {
    let (day, rest) = text.split_once(' ')?;
    if day.is_empty() || !day.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(rest.trim_start())
}

fn parse_weekday_iso(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(strip_weekday(text.trim_end())?, ISO_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// `±HH`, `±HHMM` or `±HH:MM`.
fn parse_numeric_offset(token: &str) -> Option<FixedOffset> {
    let sign = match token.chars().next()? {
        '+' => 1,
        '-' => -1,
        _ => return None,
    };
    let body = &token[1..];
    if !body.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return None;
    }
    let (hours, minutes) = match body.len() {
        2 => (body, "00"),
        4 => (&body[..2], &body[2..]),
        5 if body.as_bytes()[2] == b':' => (&body[..2], &body[3..]),
        _ => return None,
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[derive(Debug, Clone)]
pub struct TimestampParser {
    layouts: Vec<TimestampLayout>,
}

impl Default for TimestampParser {
    fn default() -> Self {
        Self::new(TimestampLayout::DEFAULT_ORDER.to_vec())
    }
}

impl TimestampParser {
    pub fn new(layouts: Vec<TimestampLayout>) -> Self {
        Self { layouts }
    }

    /// First layout that accepts `text`, with the parsed instant.
    pub fn parse(&self, text: &str) -> Option<(TimestampLayout, DateTime<Utc>)> {
        self.layouts
            .iter()
            .find_map(|layout| layout.parse(text).map(|ts| (*layout, ts)))
    }

    /// Never fails: unparsable input comes back unchanged as text.
    pub fn parse_field(&self, field: &str, text: &str) -> FieldValue {
        match self.parse(text) {
            Some((_, ts)) => FieldValue::Timestamp(ts),
            None => {
                warn!(field, value = text, "failed to parse timestamp; keeping raw text");
                FieldValue::Text(text.to_string())
            }
        }
    }
}

/// Per-report designation of fields that bypass numeric inference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldRules {
    pub timestamp_fields: Vec<String>,
    pub verbatim_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldRole {
    Timestamp,
    Verbatim,
    Inferred,
}

impl FieldRules {
    pub fn new<T, V>(timestamp_fields: T, verbatim_fields: V) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            timestamp_fields: timestamp_fields.into_iter().map(Into::into).collect(),
            verbatim_fields: verbatim_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// `chronyc tracking`: the reference time is a timestamp, the reference id
    /// stays text even when it looks like an address or a number.
    pub fn tracking() -> Self {
        Self::new(["Ref_time_(UTC)"], ["Reference_ID"])
    }

    pub fn time_status() -> Self {
        Self::new(["Local_time", "Universal_time", "RTC_time"], ["Time_zone"])
    }

    fn role(&self, label: &str) -> FieldRole {
        if self.timestamp_fields.iter().any(|f| f == label) {
            FieldRole::Timestamp
        } else if self.verbatim_fields.iter().any(|f| f == label) {
            FieldRole::Verbatim
        } else {
            FieldRole::Inferred
        }
    }
}

/// Parser for `label: value` blocks.
#[derive(Debug, Clone, Default)]
pub struct KeyValueBlockParser {
    rules: FieldRules,
    timestamps: TimestampParser,
}

impl KeyValueBlockParser {
    pub fn new(rules: FieldRules) -> Self {
        Self {
            rules,
            timestamps: TimestampParser::default(),
        }
    }

    pub fn parse(&self, raw: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        for line in raw.lines() {
            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let label = normalize_label(label);
            let value = value.trim();
            let parsed = match self.rules.role(&label) {
                FieldRole::Timestamp => self.timestamps.parse_field(&label, value),
                FieldRole::Verbatim => FieldValue::Text(value.to_string()),
                FieldRole::Inferred => extract_numeric(value)
                    .map(FieldValue::from)
                    .unwrap_or_else(|| FieldValue::Text(value.to_string())),
            };
            fields.insert(label, parsed);
        }
        fields
    }
}

pub const FIRST_DUPLICATE_SUFFIX: &str = "ntp";
pub const SECOND_DUPLICATE_SUFFIX: &str = "cmd";

/// Column names for a header row whose labels may repeat.
///
/// `chronyc clients` prints the same short headers once for NTP traffic and
/// again for command traffic, so a repeated label is named by position: the
/// first occurrence gets `_ntp`, the second `_cmd`, later ones their
/// 1-based occurrence number.
pub fn resolve_column_names(headers: &[&str]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for &header in headers {
        *counts.entry(header).or_default() += 1;
    }

    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut columns = Vec::with_capacity(headers.len());
    for &header in headers {
        let occurrence = seen.entry(header).or_default();
        *occurrence += 1;
        let base = normalize_label(header);
        let name = if counts[header] > 1 {
            match *occurrence {
                1 => format!("{base}_{FIRST_DUPLICATE_SUFFIX}"),
                2 => format!("{base}_{SECOND_DUPLICATE_SUFFIX}"),
                n => format!("{base}_{n}"),
            }
        } else {
            base
        };
        columns.push(name);
    }
    columns
}

/// Rows of a header / rule / data table, values left as raw tokens.
///
/// Fewer than three lines yields no rows. Rows shorter than the header are
/// dropped; extra trailing tokens are ignored.
pub fn parse_tabular_list(raw: &str) -> Vec<ClientRow> {
    let lines: Vec<&str> = raw.trim().lines().collect();
    if lines.len() < 3 {
        return Vec::new();
    }

    let headers: Vec<&str> = lines[0].split_whitespace().collect();
    let columns = resolve_column_names(&headers);

    lines[2..]
        .iter()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < columns.len() {
                return None;
            }
            Some(
                columns
                    .iter()
                    .cloned()
                    .zip(tokens.into_iter().map(str::to_string))
                    .collect::<ClientRow>(),
            )
        })
        .collect()
}

/// Turns the raw text of one report into the fields of its record.
pub trait ReportAdapter: Send + Sync {
    fn category(&self) -> RecordCategory;

    fn parse(&self, raw: &str) -> FieldMap;

    fn assemble(&self, raw: &str, captured_at: DateTime<Utc>) -> Record {
        Record::stamped(self.category(), self.parse(raw), captured_at)
    }
}

#[derive(Debug, Clone)]
struct KeyValueReportAdapter {
    category: RecordCategory,
    parser: KeyValueBlockParser,
}

impl ReportAdapter for KeyValueReportAdapter {
    fn category(&self) -> RecordCategory {
        self.category
    }

    fn parse(&self, raw: &str) -> FieldMap {
        self.parser.parse(raw)
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientListAdapter;

impl ReportAdapter for ClientListAdapter {
    fn category(&self) -> RecordCategory {
        RecordCategory::Client
    }

    fn parse(&self, raw: &str) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(CLIENTS_FIELD, FieldValue::Rows(parse_tabular_list(raw)));
        fields
    }
}

pub fn tracking_adapter() -> impl ReportAdapter {
    KeyValueReportAdapter {
        category: RecordCategory::Tracking,
        parser: KeyValueBlockParser::new(FieldRules::tracking()),
    }
}

pub fn time_status_adapter() -> impl ReportAdapter {
    KeyValueReportAdapter {
        category: RecordCategory::Time,
        parser: KeyValueBlockParser::new(FieldRules::time_status()),
    }
}

pub fn client_list_adapter() -> impl ReportAdapter {
    ClientListAdapter
}

pub fn adapter_for_category(category: RecordCategory) -> Box<dyn ReportAdapter> {
    match category {
        RecordCategory::Tracking => Box::new(tracking_adapter()),
        RecordCategory::Client => Box::new(client_list_adapter()),
        RecordCategory::Time => Box::new(time_status_adapter()),
    }
}

/// Raw report text gathered in one poll cycle. Categories whose fetch
/// failed are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSample {
    texts: BTreeMap<RecordCategory, String>,
}

impl RawSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(
        tracking: impl Into<String>,
        clients: impl Into<String>,
        time: impl Into<String>,
    ) -> Self {
        let mut sample = Self::new();
        sample.insert(RecordCategory::Tracking, tracking);
        sample.insert(RecordCategory::Client, clients);
        sample.insert(RecordCategory::Time, time);
        sample
    }

    pub fn insert(&mut self, category: RecordCategory, text: impl Into<String>) {
        self.texts.insert(category, text.into());
    }

    pub fn get(&self, category: RecordCategory) -> Option<&str> {
        self.texts.get(&category).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

pub struct SampleAssembler {
    adapters: Vec<Box<dyn ReportAdapter>>,
}

impl Default for SampleAssembler {
    fn default() -> Self {
        Self {
            adapters: RecordCategory::ALL
                .into_iter()
                .map(adapter_for_category)
                .collect(),
        }
    }
}

impl SampleAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// One record per category present in `raw`, all stamped with `captured_at`.
    pub fn assemble(&self, raw: &RawSample, captured_at: DateTime<Utc>) -> Vec<Record> {
        self.adapters
            .iter()
            .filter_map(|adapter| {
                raw.get(adapter.category())
                    .map(|text| adapter.assemble(text, captured_at))
            })
            .collect()
    }

    pub fn assemble_one(
        &self,
        category: RecordCategory,
        raw: &str,
        captured_at: DateTime<Utc>,
    ) -> Record {
        match self.adapters.iter().find(|a| a.category() == category) {
            Some(adapter) => adapter.assemble(raw, captured_at),
            None => adapter_for_category(category).assemble(raw, captured_at),
        }
    }
}

/// Read a captured report from disk, e.g. saved `chronyc tracking` output.
pub fn read_report_text(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("reading report text {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn fixture(name: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(name);
        read_report_text(path).expect("fixture")
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    #[test]
    fn strings_without_digits_have_no_numeric_value() {
        for input in ["", "Normal", "seconds fast of NTP time", "-", ".", "+-."] {
            assert_eq!(extract_numeric(input), None, "input {input:?}");
        }
    }

    #[test]
    fn integers_and_decimals_are_typed_by_the_fraction_separator() {
        assert_eq!(extract_numeric("4"), Some(Numeric::Integer(4)));
        assert_eq!(extract_numeric("1024"), Some(Numeric::Integer(1024)));
        assert_eq!(extract_numeric("12.345"), Some(Numeric::Decimal(12.345)));
        assert_eq!(extract_numeric("0.000123"), Some(Numeric::Decimal(0.000123)));
        assert_eq!(extract_numeric(".5"), Some(Numeric::Decimal(0.5)));
    }

    #[test]
    fn first_literal_wins_and_only_decimals_keep_a_sign() {
        assert_eq!(
            extract_numeric("-0.000003921 seconds"),
            Some(Numeric::Decimal(-0.000003921))
        );
        assert_eq!(extract_numeric("+7 ppm"), Some(Numeric::Integer(7)));
        assert_eq!(extract_numeric("-12 then 5"), Some(Numeric::Integer(12)));
        assert_eq!(extract_numeric("-12 ppm"), Some(Numeric::Integer(12)));
        assert_eq!(extract_numeric("Residual freq : -0.001 ppm"), Some(Numeric::Decimal(-0.001)));
        assert_eq!(extract_numeric("12.345 ppm slow, 9"), Some(Numeric::Decimal(12.345)));
        assert_eq!(
            extract_numeric("A9FEA97B (169.254.169.123)"),
            Some(Numeric::Integer(9))
        );
    }

    #[test]
    fn overflowing_literal_has_no_numeric_value() {
        assert_eq!(extract_numeric("99999999999999999999999"), None);
    }

    #[test]
    fn each_layout_parses_its_own_shape() {
        let instant = utc(2025, 7, 9, 6, 23, 55);
        let parser = TimestampParser::default();
        let cases = [
            ("Wed Jul 09 06:23:55 2025", TimestampLayout::CtimeUtc),
            ("Wed 2025-07-09 06:23:55 UTC", TimestampLayout::ZoneName),
            ("Wed 2025-07-09 13:23:55 +07", TimestampLayout::NumericOffset),
            ("Wed 2025-07-09 13:23:55 +0700", TimestampLayout::NumericOffset),
            ("Wed 2025-07-09 01:23:55 -05:00", TimestampLayout::NumericOffset),
            ("Wed 2025-07-09 06:23:55", TimestampLayout::Naive),
        ];
        for (input, layout) in cases {
            assert_eq!(parser.parse(input), Some((layout, instant)), "input {input:?}");
        }
    }

    #[test]
    fn day_name_disagreeing_with_the_date_is_ignored() {
        let parser = TimestampParser::default();
        let instant = utc(2025, 7, 9, 6, 23, 55);
        let cases = [
            ("Mon Jul 09 06:23:55 2025", TimestampLayout::CtimeUtc),
            ("Fri 2025-07-09 06:23:55 UTC", TimestampLayout::ZoneName),
            ("Sun 2025-07-09 13:23:55 +07:00", TimestampLayout::NumericOffset),
            ("Tue 2025-07-09 06:23:55", TimestampLayout::Naive),
        ];
        for (input, layout) in cases {
            assert_eq!(parser.parse(input), Some((layout, instant)), "input {input:?}");
        }
        assert_eq!(
            parser.parse_field("Ref_time_(UTC)", "Mon Jul 09 06:23:55 2025"),
            FieldValue::Timestamp(instant)
        );
    }

    #[test]
    fn day_name_must_be_alphabetic() {
        let parser = TimestampParser::default();
        for input in [
            "2025-07-09 06:23:55",
            "W3d 2025-07-09 06:23:55",
            "07 Jul 09 06:23:55 2025",
        ] {
            assert_eq!(parser.parse(input), None, "input {input:?}");
        }
    }

    #[test]
    fn zone_bearing_layouts_are_tried_before_the_bare_one() {
        let parser = TimestampParser::default();
        let (layout, _) = parser.parse("Wed 2025-07-09 06:23:55 GMT").expect("parses");
        assert_eq!(layout, TimestampLayout::ZoneName);
        assert_eq!(TimestampLayout::Naive.parse("Wed 2025-07-09 06:23:55 GMT"), None);
    }

    #[test]
    fn formatted_timestamps_reparse_to_the_same_instant() {
        let parser = TimestampParser::default();
        let instants = [
            utc(2025, 7, 9, 6, 23, 55),
            utc(2024, 2, 29, 23, 59, 59),
            utc(1999, 12, 31, 0, 0, 0),
        ];
        for layout in TimestampLayout::DEFAULT_ORDER {
            for instant in instants {
                let formatted = layout.format(instant);
                assert_eq!(layout.parse(&formatted), Some(instant), "{formatted}");
                assert_eq!(
                    parser.parse(&formatted).map(|(_, ts)| ts),
                    Some(instant),
                    "{formatted}"
                );
            }
        }
    }

    #[test]
    fn unparsable_timestamps_come_back_unchanged() {
        let parser = TimestampParser::default();
        for input in [
            "",
            "never",
            "2025-07-09 06:23:55",
            "Wed 2025-07-09 13:23:55 CEST",
            "Wed 2025-07-09 13:23:55 +7",
        ] {
            assert_eq!(parser.parse_field("Ref_time_(UTC)", input), text(input));
        }
    }

    #[test]
    fn tracking_scenario_keeps_reference_id_as_text() {
        let parser = KeyValueBlockParser::new(FieldRules::tracking());
        let fields =
            parser.parse("Reference ID    : 123.45.67.1\nSystem time     : 0.000123 seconds\n");

        assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["Reference_ID", "System_time"]);
        assert_eq!(fields.get("Reference_ID"), Some(&text("123.45.67.1")));
        assert_eq!(fields.get("System_time"), Some(&FieldValue::Decimal(0.000123)));
    }

    #[test]
    fn lines_without_colon_are_ignored_and_last_label_wins() {
        let parser = KeyValueBlockParser::new(FieldRules::default());
        let fields = parser.parse("header line\nStratum : 3\n\nStratum : 4\nLeap status : Normal");

        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("Stratum"), Some(&FieldValue::Integer(4)));
        assert_eq!(fields.get("Leap_status"), Some(&text("Normal")));
    }

    #[test]
    fn key_value_parsing_is_idempotent() {
        let parser = KeyValueBlockParser::new(FieldRules::tracking());
        let raw = fixture("chronyc-tracking.txt");
        assert_eq!(parser.parse(&raw), parser.parse(&raw));
    }

    #[test]
    fn empty_input_yields_empty_fields() {
        let parser = KeyValueBlockParser::new(FieldRules::time_status());
        assert!(parser.parse("").is_empty());
        assert!(parse_tabular_list("").is_empty());
    }

    #[test]
    fn tracking_fixture_is_fully_typed() {
        let fields = tracking_adapter().parse(&fixture("chronyc-tracking.txt"));

        assert_eq!(fields.get("Reference_ID"), Some(&text("A9FEA97B (169.254.169.123)")));
        assert_eq!(fields.get("Stratum"), Some(&FieldValue::Integer(4)));
        assert_eq!(
            fields.get("Ref_time_(UTC)"),
            Some(&FieldValue::Timestamp(utc(2025, 7, 9, 6, 23, 55)))
        );
        assert_eq!(fields.get("System_time"), Some(&FieldValue::Decimal(0.000012345)));
        assert_eq!(fields.get("Last_offset"), Some(&FieldValue::Decimal(-0.000003921)));
        assert_eq!(fields.get("Frequency"), Some(&FieldValue::Decimal(12.345)));
        assert_eq!(fields.get("Update_interval"), Some(&FieldValue::Decimal(16.1)));
        assert_eq!(fields.get("Leap_status"), Some(&text("Normal")));
    }

    #[test]
    fn time_status_fixture_types_clock_readings() {
        let fields = time_status_adapter().parse(&fixture("timedatectl-status.txt"));
        let instant = FieldValue::Timestamp(utc(2025, 7, 9, 6, 23, 55));

        assert_eq!(fields.get("Local_time"), Some(&instant));
        assert_eq!(fields.get("Universal_time"), Some(&instant));
        assert_eq!(fields.get("RTC_time"), Some(&instant));
        assert_eq!(fields.get("Time_zone"), Some(&text("Asia/Bangkok (+07, +0700)")));
        assert_eq!(fields.get("System_clock_synchronized"), Some(&text("yes")));
        assert_eq!(fields.get("NTP_service"), Some(&text("active")));
        assert_eq!(fields.get("RTC_in_local_TZ"), Some(&text("no")));
    }

    #[test]
    fn repeated_headers_are_named_by_position() {
        assert_eq!(resolve_column_names(&["A", "B", "A"]), vec!["A_ntp", "B", "A_cmd"]);
        assert_eq!(
            resolve_column_names(&["X", "X", "X", "X"]),
            vec!["X_ntp", "X_cmd", "X_3", "X_4"]
        );
    }

    #[test]
    fn duplicate_resolution_ignores_row_values() {
        let rows = parse_tabular_list("A B A\n-----\n1 2 3\n3 2 1");
        let keys: Vec<Vec<&str>> = rows.iter().map(|r| r.keys().collect()).collect();
        assert_eq!(keys, vec![vec!["A_ntp", "B", "A_cmd"]; 2]);
        assert_eq!(rows[1].get("A_ntp").map(String::as_str), Some("3"));
    }

    #[test]
    fn header_and_rule_without_rows_is_empty() {
        assert!(parse_tabular_list("Hostname NTP Drop\n=================\n").is_empty());
        assert!(parse_tabular_list("Hostname NTP Drop").is_empty());
    }

    #[test]
    fn client_scenario_splits_ntp_and_cmd_counts() {
        let rows =
            parse_tabular_list("Hostname NTP NTP Drop\n=====================\nhost1 5 6 0\n");
        let expected: ClientRow = [
            ("Hostname", "host1"),
            ("NTP_ntp", "5"),
            ("NTP_cmd", "6"),
            ("Drop", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
        assert_eq!(rows, vec![expected]);
    }

    #[test]
    fn short_rows_are_dropped_and_long_rows_truncated() {
        let rows = parse_tabular_list("Host NTP\n----\nshort\nhost1 5 extra tokens\nhost2 7\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 2);
        assert_eq!(rows[0].get("NTP").map(String::as_str), Some("5"));
        assert_eq!(rows[1].get("Host").map(String::as_str), Some("host2"));
    }

    #[test]
    fn clients_fixture_resolves_all_duplicate_columns() {
        let rows = parse_tabular_list(&fixture("chronyc-clients.txt"));
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[0].keys().collect::<Vec<_>>(),
            vec![
                "Hostname", "NTP", "Drop_ntp", "Int_ntp", "IntL", "Last_ntp", "Cmd", "Drop_cmd",
                "Int_cmd", "Last_cmd"
            ]
        );
        assert_eq!(rows[1].get("Hostname").map(String::as_str), Some("laptop.lan"));
        assert_eq!(rows[1].get("NTP").map(String::as_str), Some("128"));
        assert_eq!(rows[1].get("Last_cmd").map(String::as_str), Some("120"));
    }

    #[test]
    fn one_cycle_shares_a_single_capture_instant() {
        let captured_at = utc(2025, 7, 9, 6, 24, 0);
        let raw = RawSample::complete(
            fixture("chronyc-tracking.txt"),
            fixture("chronyc-clients.txt"),
            fixture("timedatectl-status.txt"),
        );
        let records = SampleAssembler::new().assemble(&raw, captured_at);

        assert_eq!(
            records.iter().map(|r| r.category).collect::<Vec<_>>(),
            RecordCategory::ALL.to_vec()
        );
        assert!(records.iter().all(|r| r.captured_at() == Some(captured_at)));
    }

    #[test]
    fn client_record_wraps_rows_in_one_field() {
        let captured_at = utc(2025, 7, 9, 6, 24, 0);
        let record = SampleAssembler::new().assemble_one(
            RecordCategory::Client,
            &fixture("chronyc-clients.txt"),
            captured_at,
        );
        assert_eq!(record.fields.keys().collect::<Vec<_>>(), vec![CLIENTS_FIELD, "Timestamp"]);
        assert_eq!(
            record.get(CLIENTS_FIELD).and_then(FieldValue::as_rows).map(<[_]>::len),
            Some(3)
        );
    }

    #[test]
    fn missing_reports_are_skipped() {
        let mut raw = RawSample::new();
        raw.insert(RecordCategory::Time, fixture("timedatectl-status.txt"));
        let records = SampleAssembler::new().assemble(&raw, Utc::now());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, RecordCategory::Time);
    }

    #[test]
    fn empty_report_still_produces_a_stamped_record() {
        let captured_at = utc(2025, 7, 9, 6, 24, 0);
        let raw = RawSample::complete("", "", "");
        let records = SampleAssembler::new().assemble(&raw, captured_at);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].fields.len(), 1);
        assert_eq!(records[1].get(CLIENTS_FIELD), Some(&FieldValue::Rows(Vec::new())));
    }
}
