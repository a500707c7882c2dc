//! Time-context library: a markdown document that tracks "now", named events on either
//! side of it, ordered event sequences, and named spans.
//! Parsing and rendering are pure; storage and the clock sit at the edges.

pub mod core {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{Deserialize, Serialize};

    /* ----------------------------- Vocabulary ----------------------------- */

    pub const TITLE_HEADING: &str = "# Time Context";
    pub const NOW_HEADING: &str = "## Now";
    pub const TIMELINE_HEADING: &str = "## Timeline";
    pub const BEHIND_HEADING: &str = "### Behind (Past)";
    pub const AHEAD_HEADING: &str = "### Ahead (Future)";
    pub const SEQUENCES_HEADING: &str = "## Sequences";
    pub const DURATIONS_HEADING: &str = "## Durations";

    pub const EVENT_TABLE_HEADER: &str = "| distance | event | type | notes | iso |";
    pub const EVENT_TABLE_RULE: &str = "|----------|-------|------|-------|-----|";
    pub const SPAN_TABLE_HEADER: &str = "| span | from | to | length |";
    pub const SPAN_TABLE_RULE: &str = "|------|------|----|--------|";

    /// Placeholder inserted into sequence chains at render time; never stored.
    pub const NOW_MARKER: &str = "[NOW]";
    pub const CHAIN_SEPARATOR: &str = " → ";

    /// Instants are kept at millisecond precision so they survive the document round trip.
    pub fn to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
        at.trunc_subsecs(3)
    }

    pub fn format_iso(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: the whole time-context document.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimeContext {
        pub now: Now,
        /// Events strictly before `now`, ascending by instant.
        #[serde(default)]
        pub behind_events: Vec<Event>,
        /// Events at or after `now`, ascending by instant.
        #[serde(default)]
        pub ahead_events: Vec<Event>,
        #[serde(default)]
        pub sequences: Vec<Sequence>,
        #[serde(default)]
        pub spans: Vec<Span>,
    }

    /* ------------------------------ Entities ------------------------------ */

    /// Snapshot of the current moment. Replaced wholesale, never patched.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Now {
        pub timestamp: DateTime<Utc>,
        pub weekday: String,
        /// `"<iso week> of <weeks in year>"`.
        pub week: String,
        /// `"Q<n> <year>"`.
        pub quarter: String,
        /// IANA zone name used for the weekday.
        pub timezone: String,
    }

    /// A named point in time.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Event {
        pub name: String,
        pub at: DateTime<Utc>,
        /// Cached display distance relative to the `now` it was computed against.
        /// Only `upsert_event` and `rebuild_event_positions` refresh it.
        pub distance: String,
        #[serde(rename = "type")]
        pub kind: Option<String>,
        pub notes: Option<String>,
    }

    impl Event {
        pub fn new(name: impl Into<String>, at: DateTime<Utc>) -> Self {
            Self {
                name: name.into(),
                at: to_millis(at),
                distance: String::new(),
                kind: None,
                notes: None,
            }
        }
    }

    /// Ordered chain of event names. Names are weak references and may dangle.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Sequence {
        pub name: String,
        pub events: Vec<String>,
    }

    /// Named span. All fields are display text computed when the span was defined.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Span {
        pub name: String,
        pub from: String,
        pub to: String,
        pub length: String,
    }

    /// Case-insensitive name comparison used for events, sequences and spans.
    pub fn same_name(a: &str, b: &str) -> bool {
        a.to_lowercase() == b.to_lowercase()
    }
}

pub mod errors {
    use std::path::PathBuf;

    /// Failures of the free-form time parsers. Only the last strategy's error surfaces.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ParseError {
        #[error("Duration cannot be empty. Expected formats like '3 days' or '2 hours ago'.")]
        EmptyDuration,
        #[error("Invalid duration '{0}'. Use forms like '3 days', 'in 2 hours', or '5 days ago'.")]
        InvalidDuration(String),
        #[error("Date input cannot be empty.")]
        EmptyDate,
        #[error(
            "Could not parse date '{0}'. Use ISO (2026-02-20), named date (Feb 20 2026), or relative forms (tomorrow, next Monday)."
        )]
        InvalidDate(String),
        #[error(
            "Could not parse --at datetime '{0}'. Use an ISO datetime like 2026-02-20T14:00:00Z."
        )]
        InvalidDateTime(String),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("{} not found", .0.display())]
        NotFound(PathBuf),
        #[error("Refusing to follow symlink at '{}'.", .0.display())]
        SymlinkRefused(PathBuf),
        #[error("I/O failure on {}: {source}", path.display())]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }

    /// User-facing command errors. Any of these aborts the command before it writes.
    #[derive(Debug, thiserror::Error)]
    pub enum TemporalError {
        #[error("{0}")]
        MissingArgument(String),
        #[error("Provide exactly one of --in, --on, or --at.")]
        AmbiguousTime,
        #[error("Event '{0}' already exists. Use a distinct name.")]
        DuplicateEvent(String),
        #[error("Event '{0}' already exists in the scratch pad.")]
        DuplicateScratchEvent(String),
        #[error("'{0}' cannot be a sequence member. Names may not contain '→' or '->' or be [NOW].")]
        InvalidSequenceMember(String),
        #[error("Event '{name}' not found. Available events: {available}")]
        UnknownEvent { name: String, available: String },
        #[error("--from must be before --to.")]
        InvalidSpan,
        #[error("{} not found. Run '{hint}' first.", path.display())]
        DocumentNotFound { path: PathBuf, hint: &'static str },
        #[error("Invalid timezone '{0}'. Use an IANA zone name such as Europe/Berlin.")]
        InvalidTimezone(String),
        #[error("{} already exists. Use --force to overwrite.", .0.display())]
        AlreadyInitialized(PathBuf),
        #[error("Label '{0}' contains no valid characters.")]
        InvalidLabel(String),
        #[error("malformed document: {}", .0.join("; "))]
        MalformedDocument(Vec<String>),
        #[error(transparent)]
        Parse(#[from] ParseError),
        #[error(transparent)]
        Store(#[from] StoreError),
    }
}

pub mod duration {
    //! Relative duration phrases: `3 days`, `in 2 hours`, `5 days ago`, `1 week from now`.
    //!
    //! A month is exactly 30 days; there is no calendar arithmetic here.

    use crate::errors::ParseError;
    use chrono::{DateTime, TimeDelta, Utc};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, digit1, multispace0},
        combinator::{all_consuming, map, opt, recognize},
        error::VerboseError,
        sequence::{pair, terminated, tuple},
    };

    pub const MINUTE_MS: i64 = 60 * 1000;
    pub const HOUR_MS: i64 = 60 * MINUTE_MS;
    pub const DAY_MS: i64 = 24 * HOUR_MS;
    pub const WEEK_MS: i64 = 7 * DAY_MS;
    pub const MONTH_MS: i64 = 30 * DAY_MS;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Past,
        Future,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DurationUnit {
        Minute,
        Hour,
        Day,
        Week,
        Month,
    }

    impl DurationUnit {
        pub fn millis(self) -> i64 {
            match self {
                DurationUnit::Minute => MINUTE_MS,
                DurationUnit::Hour => HOUR_MS,
                DurationUnit::Day => DAY_MS,
                DurationUnit::Week => WEEK_MS,
                DurationUnit::Month => MONTH_MS,
            }
        }
    }

    /// Magnitude plus direction; `ms` is never negative.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct ParsedDuration {
        pub ms: f64,
        pub direction: Direction,
    }

    impl ParsedDuration {
        /// Signed offset rounded to whole milliseconds, `None` when it does not fit.
        pub fn signed_offset(&self) -> Option<TimeDelta> {
            let ms = self.ms.round();
            if !ms.is_finite() || ms >= i64::MAX as f64 {
                return None;
            }
            let ms = ms as i64;
            match self.direction {
                Direction::Past => TimeDelta::try_milliseconds(-ms),
                Direction::Future => TimeDelta::try_milliseconds(ms),
            }
        }

        pub fn apply(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
            base.checked_add_signed(self.signed_offset()?)
        }
    }

    pub fn parse_duration(input: &str) -> Result<ParsedDuration, ParseError> {
        let lowered = input.trim().to_lowercase();
        if lowered.is_empty() {
            return Err(ParseError::EmptyDuration);
        }

        let mut text = lowered.as_str();
        let mut direction = Direction::Future;
        if let Some(rest) = text.strip_prefix("in ") {
            text = rest.trim();
        }
        if let Some(rest) = text.strip_suffix(" ago") {
            text = rest.trim();
            direction = Direction::Past;
        } else if let Some(rest) = text.strip_suffix(" from now") {
            text = rest.trim();
            direction = Direction::Future;
        }

        let invalid = || ParseError::InvalidDuration(input.trim().to_string());
        let (_, (number, unit)) = quantity(text).map_err(|_| invalid())?;
        let mut value: f64 = number.parse().map_err(|_| invalid())?;
        if !value.is_finite() {
            return Err(invalid());
        }
        if value < 0.0 {
            value = value.abs();
            direction = Direction::Past;
        }

        Ok(ParsedDuration {
            ms: value * unit.millis() as f64,
            direction,
        })
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn quantity(i: &str) -> PResult<'_, (&str, DurationUnit)> {
        map(
            all_consuming(tuple((number, multispace0, unit))),
            |(number, _, unit)| (number, unit),
        )(i)
    }

    fn number(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        )))(i)
    }

    fn unit(i: &str) -> PResult<'_, DurationUnit> {
        terminated(
            alt((
                map(tag("minute"), |_| DurationUnit::Minute),
                map(tag("hour"), |_| DurationUnit::Hour),
                map(tag("day"), |_| DurationUnit::Day),
                map(tag("week"), |_| DurationUnit::Week),
                map(tag("month"), |_| DurationUnit::Month),
            )),
            opt(char('s')),
        )(i)
    }

}

pub mod dates {
    //! Date inputs anchored to a base instant.
    //!
    //! Strategies run in order and the first match wins: relative keywords
    //! (`today`, `tomorrow`, `yesterday`, `next <weekday>`), duration phrases, then absolute
    //! dates. Naive dates and date-times are read as UTC.

    use crate::core::to_millis;
    use crate::duration::parse_duration;
    use crate::errors::{ParseError, TemporalError};
    use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Utc, Weekday};

    const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

    /// `%Y` also takes the signed extended years (`+10240`, `-0438`) that RFC 3339 rejects.
    const NAIVE_DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    const DATE_FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%m/%d/%Y",
        "%b %d %Y",
        "%b %d, %Y",
        "%B %d %Y",
        "%B %d, %Y",
        "%d %b %Y",
        "%d %B %Y",
        "%a %b %d %Y",
    ];

    pub fn parse_date_input(input: &str, base: DateTime<Utc>) -> Result<DateTime<Utc>, ParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParseError::EmptyDate);
        }

        if let Some(at) = relative_keyword(&trimmed.to_lowercase(), base) {
            return Ok(to_millis(at));
        }

        if let Some(at) = parse_duration(trimmed).ok().and_then(|d| d.apply(base)) {
            return Ok(to_millis(at));
        }

        parse_absolute(trimmed).map_err(|_| ParseError::InvalidDate(trimmed.to_string()))
    }

    /// ISO-8601 instants, naive ISO date-times, and common written dates.
    pub fn parse_absolute(input: &str) -> Result<DateTime<Utc>, ParseError> {
        let trimmed = input.trim();

        if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(to_millis(at.with_timezone(&Utc)));
        }
        for format in OFFSET_DATETIME_FORMATS {
            if let Ok(at) = DateTime::parse_from_str(trimmed, format) {
                return Ok(to_millis(at.with_timezone(&Utc)));
            }
        }
        for format in NAIVE_DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(to_millis(naive.and_utc()));
            }
        }
        for format in DATE_FORMATS {
            if let Some(naive) = NaiveDate::parse_from_str(trimmed, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
            {
                return Ok(naive.and_utc());
            }
        }

        Err(ParseError::InvalidDate(trimmed.to_string()))
    }

    /// Resolve the `--in` / `--on` / `--at` trio; exactly one must be given.
    pub fn parse_event_date(
        in_duration: Option<&str>,
        on_date: Option<&str>,
        at_datetime: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, TemporalError> {
        let given = [in_duration, on_date, at_datetime]
            .into_iter()
            .filter(|v| v.is_some_and(|s| !s.is_empty()))
            .count();
        if given != 1 {
            return Err(TemporalError::AmbiguousTime);
        }

        if let Some(raw) = in_duration.filter(|s| !s.is_empty()) {
            let parsed = parse_duration(raw)?;
            let at = parsed
                .apply(now)
                .ok_or_else(|| ParseError::InvalidDuration(raw.trim().to_string()))?;
            return Ok(to_millis(at));
        }

        if let Some(raw) = on_date.filter(|s| !s.is_empty()) {
            return Ok(parse_date_input(raw, now)?);
        }

        let raw = at_datetime.unwrap_or_default();
        parse_absolute(raw).map_err(|_| ParseError::InvalidDateTime(raw.trim().to_string()).into())
    }

    fn relative_keyword(value: &str, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match value {
            "today" => return Some(base),
            "tomorrow" => return base.checked_add_signed(TimeDelta::days(1)),
            "yesterday" => return base.checked_add_signed(TimeDelta::days(-1)),
            _ => {}
        }

        let mut words = value.split_whitespace();
        let (Some("next"), Some(day), None) = (words.next(), words.next(), words.next()) else {
            return None;
        };
        let target = weekday_named(day)?;
        let current = base.weekday().num_days_from_sunday() as i64;
        let mut delta = (target.num_days_from_sunday() as i64 - current + 7) % 7;
        if delta == 0 {
            delta = 7;
        }
        base.checked_add_signed(TimeDelta::days(delta))
    }

    fn weekday_named(day: &str) -> Option<Weekday> {
        match day {
            "monday" => Some(Weekday::Mon),
            "tuesday" => Some(Weekday::Tue),
            "wednesday" => Some(Weekday::Wed),
            "thursday" => Some(Weekday::Thu),
            "friday" => Some(Weekday::Fri),
            "saturday" => Some(Weekday::Sat),
            "sunday" => Some(Weekday::Sun),
            _ => None,
        }
    }

}

pub mod distance {
    use crate::core::Event;
    use crate::duration::{DAY_MS, HOUR_MS, MINUTE_MS, MONTH_MS, WEEK_MS};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /// Which side of "now" an instant falls on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Position {
        Behind,
        Ahead,
    }

    impl fmt::Display for Position {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Position::Behind => f.write_str("behind"),
                Position::Ahead => f.write_str("ahead"),
            }
        }
    }

    /// One coarse unit and its rounded count, e.g. `6 hours`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoarseDistance {
        pub value: i64,
        pub unit: &'static str,
    }

    impl fmt::Display for CoarseDistance {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let plural = if self.value == 1 { "" } else { "s" };
            write!(f, "{} {}{}", self.value, self.unit, plural)
        }
    }

    pub fn unit_for(ms: i64) -> CoarseDistance {
        let (unit_ms, unit) = if ms < HOUR_MS {
            (MINUTE_MS, "minute")
        } else if ms < DAY_MS {
            (HOUR_MS, "hour")
        } else if ms < 14 * DAY_MS {
            (DAY_MS, "day")
        } else if ms < 8 * WEEK_MS {
            (WEEK_MS, "week")
        } else {
            (MONTH_MS, "month")
        };
        let value = (ms as f64 / unit_ms as f64).round() as i64;
        CoarseDistance {
            value: value.max(0),
            unit,
        }
    }

    /// `"<N> <unit>[s] ahead"` or `"... behind"`; equal instants count as ahead.
    pub fn format_distance(target: DateTime<Utc>, now: DateTime<Utc>) -> String {
        let diff = (target - now).num_milliseconds();
        format!(
            "{} {}",
            unit_for(diff.saturating_abs()),
            classify_position(target, now)
        )
    }

    pub fn format_length(ms: i64) -> String {
        unit_for(ms.saturating_abs()).to_string()
    }

    pub fn classify_position(target: DateTime<Utc>, now: DateTime<Utc>) -> Position {
        if target < now {
            Position::Behind
        } else {
            Position::Ahead
        }
    }

    /// Stable ascending sort by instant.
    pub fn sort_timeline(events: &mut [Event]) {
        events.sort_by_key(|event| event.at);
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::TimeDelta;

        fn now() -> DateTime<Utc> {
            "2026-02-17T12:00:00Z".parse().unwrap()
        }

        #[test]
        fn hour_boundary_is_one_hour() {
            let now = now();
            assert_eq!(format_distance(now + TimeDelta::milliseconds(3_600_000), now), "1 hour ahead");
            assert_eq!(format_distance(now - TimeDelta::milliseconds(3_600_000), now), "1 hour behind");
        }

        #[test]
        fn two_week_boundary_switches_to_weeks() {
            let just_under = TimeDelta::days(13) + TimeDelta::hours(23) + TimeDelta::minutes(59) + TimeDelta::seconds(59);
            assert_eq!(unit_for(just_under.num_milliseconds()).unit, "day");
            assert_eq!(format_length(just_under.num_milliseconds()), "14 days");
            assert_eq!(format_length(TimeDelta::days(14).num_milliseconds()), "2 weeks");
        }

        #[test]
        fn long_distances_use_thirty_day_months() {
            assert_eq!(format_length(8 * WEEK_MS), "2 months");
            assert_eq!(format_length(90 * DAY_MS), "3 months");
        }

        #[test]
        fn equal_instants_are_ahead() {
            let now = now();
            assert_eq!(classify_position(now, now), Position::Ahead);
            assert_eq!(format_distance(now, now), "0 minutes ahead");
            assert_eq!(
                classify_position(now - TimeDelta::milliseconds(1), now),
                Position::Behind
            );
        }

        #[test]
        fn singular_only_for_exactly_one() {
            assert_eq!(format_length(MINUTE_MS), "1 minute");
            assert_eq!(format_length(2 * DAY_MS), "2 days");
            assert_eq!(format_length(-2 * DAY_MS), "2 days");
            assert_eq!(unit_for(-5).value, 0);
        }

        #[test]
        fn sort_is_stable_on_equal_instants() {
            let at = now();
            let mut events = vec![
                Event::new("later", at + TimeDelta::days(1)),
                Event::new("first", at),
                Event::new("second", at),
            ];
            sort_timeline(&mut events);
            let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, ["first", "second", "later"]);
        }
    }
}

pub mod clock {
    //! Timezone resolution and the `Now` snapshot builder.

    use crate::core::{Now, to_millis};
    use crate::errors::TemporalError;
    use chrono::{DateTime, Datelike, NaiveDate, Utc};
    use chrono_tz::Tz;

    pub const FALLBACK_TIMEZONE: &str = "UTC";

    pub fn is_valid_timezone(name: &str) -> bool {
        name.parse::<Tz>().is_ok()
    }

    /// Explicit preference, then `TZ`, then the platform zone, then UTC.
    pub fn resolve_timezone(preferred: Option<&str>) -> String {
        let env_zone = std::env::var("TZ").ok();
        let platform_zone = iana_time_zone::get_timezone().ok();
        resolve_timezone_from([preferred, env_zone.as_deref(), platform_zone.as_deref()])
    }

    pub fn resolve_timezone_from<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> String {
        candidates
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|candidate| !candidate.is_empty() && is_valid_timezone(candidate))
            .unwrap_or(FALLBACK_TIMEZONE)
            .to_string()
    }

    /// Strict check for zones the user typed explicitly.
    pub fn validate_timezone(name: &str) -> Result<String, TemporalError> {
        let trimmed = name.trim();
        if is_valid_timezone(trimmed) {
            Ok(trimmed.to_string())
        } else {
            Err(TemporalError::InvalidTimezone(name.to_string()))
        }
    }

    pub fn build_now(at: DateTime<Utc>, timezone: Option<&str>) -> Now {
        now_in_zone(at, resolve_timezone(timezone))
    }

    /// Snapshot for an already resolved zone name; unknown names render the weekday in UTC.
    pub fn now_in_zone(at: DateTime<Utc>, timezone: String) -> Now {
        let at = to_millis(at);
        let zone: Tz = timezone.parse().unwrap_or(Tz::UTC);
        let date = at.date_naive();
        Now {
            timestamp: at,
            weekday: at.with_timezone(&zone).format("%A").to_string(),
            week: format!(
                "{} of {}",
                date.iso_week().week(),
                iso_weeks_in_year(date.year())
            ),
            quarter: format!("Q{} {}", date.month0() / 3 + 1, date.year()),
            timezone,
        }
    }

    fn iso_weeks_in_year(year: i32) -> u32 {
        // December 28th always falls in the last ISO week of its year.
        NaiveDate::from_ymd_opt(year, 12, 28)
            .map(|date| date.iso_week().week())
            .unwrap_or(52)
    }

}

pub mod context {
    //! Invariant-keeping operations on `TimeContext`.
    //!
    //! Partitions stay sorted by instant. Name uniqueness is checked by callers before
    //! `upsert_event`; the model does not re-validate.

    use crate::core::{Event, Now, Sequence, Span, TimeContext, same_name, to_millis};
    use crate::distance::{Position, classify_position, format_distance, sort_timeline};

    impl TimeContext {
        pub fn empty(now: Now) -> Self {
            Self {
                now,
                behind_events: vec![],
                ahead_events: vec![],
                sequences: vec![],
                spans: vec![],
            }
        }

        /// Behind then ahead; not necessarily globally sorted.
        pub fn all_events(&self) -> impl Iterator<Item = &Event> {
            self.behind_events.iter().chain(self.ahead_events.iter())
        }

        pub fn find_event(&self, name: &str) -> Option<&Event> {
            self.all_events().find(|event| same_name(&event.name, name))
        }

        pub fn has_event_name(&self, name: &str) -> bool {
            self.find_event(name).is_some()
        }

        pub fn event_names_sorted(&self) -> Vec<String> {
            let mut names: Vec<String> = self.all_events().map(|e| e.name.clone()).collect();
            names.sort_by_key(|name| name.to_lowercase());
            names
        }

        /// Compute the distance against `now`, then insert into the matching partition.
        pub fn upsert_event(&mut self, mut event: Event) -> Position {
            let now = self.now.timestamp;
            event.at = to_millis(event.at);
            event.distance = format_distance(event.at, now);
            let position = classify_position(event.at, now);
            let partition = match position {
                Position::Behind => &mut self.behind_events,
                Position::Ahead => &mut self.ahead_events,
            };
            partition.push(event);
            sort_timeline(partition);
            position
        }

        /// Re-derive every distance and partition from the current `now`.
        pub fn rebuild_event_positions(&mut self) {
            let now = self.now.timestamp;
            let merged: Vec<Event> = self
                .behind_events
                .drain(..)
                .chain(self.ahead_events.drain(..))
                .collect();

            for mut event in merged {
                event.distance = format_distance(event.at, now);
                match classify_position(event.at, now) {
                    Position::Behind => self.behind_events.push(event),
                    Position::Ahead => self.ahead_events.push(event),
                }
            }

            sort_timeline(&mut self.behind_events);
            sort_timeline(&mut self.ahead_events);
            log::debug!(
                "reclassified events: {} behind, {} ahead",
                self.behind_events.len(),
                self.ahead_events.len()
            );
        }

        /// Drops the event from its partition and from every sequence. Returns whether it existed.
        pub fn remove_event(&mut self, name: &str) -> bool {
            let before = self.behind_events.len() + self.ahead_events.len();
            self.behind_events.retain(|event| !same_name(&event.name, name));
            self.ahead_events.retain(|event| !same_name(&event.name, name));
            let removed = self.behind_events.len() + self.ahead_events.len() != before;
            if removed {
                for sequence in &mut self.sequences {
                    sequence.events.retain(|member| !same_name(member, name));
                }
            }
            removed
        }

        /// Replace a sequence with the same name or append it. Returns `true` on replace.
        pub fn put_sequence(&mut self, sequence: Sequence) -> bool {
            match self
                .sequences
                .iter_mut()
                .find(|existing| same_name(&existing.name, &sequence.name))
            {
                Some(existing) => {
                    *existing = sequence;
                    true
                }
                None => {
                    self.sequences.push(sequence);
                    false
                }
            }
        }

        pub fn put_span(&mut self, span: Span) -> bool {
            match self
                .spans
                .iter_mut()
                .find(|existing| same_name(&existing.name, &span.name))
            {
                Some(existing) => {
                    *existing = span;
                    true
                }
                None => {
                    self.spans.push(span);
                    false
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::clock::now_in_zone;
        use chrono::{DateTime, TimeDelta, Utc};

        fn base() -> DateTime<Utc> {
            "2026-02-17T12:00:00Z".parse().unwrap()
        }

        fn context() -> TimeContext {
            TimeContext::empty(now_in_zone(base(), "UTC".to_string()))
        }

        fn sorted(events: &[Event]) -> bool {
            events.windows(2).all(|pair| pair[0].at <= pair[1].at)
        }

        #[test]
        fn upsert_partitions_and_sorts() {
            let mut ctx = context();
            assert_eq!(
                ctx.upsert_event(Event::new("late", base() + TimeDelta::days(3))),
                Position::Ahead
            );
            ctx.upsert_event(Event::new("soon", base() + TimeDelta::hours(6)));
            ctx.upsert_event(Event::new("old", base() - TimeDelta::days(2)));
            ctx.upsert_event(Event::new("older", base() - TimeDelta::days(20)));

            let ahead: Vec<_> = ctx.ahead_events.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(ahead, ["soon", "late"]);
            let behind: Vec<_> = ctx.behind_events.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(behind, ["older", "old"]);
            assert_eq!(ctx.ahead_events[0].distance, "6 hours ahead");
            assert_eq!(ctx.behind_events[0].distance, "3 weeks behind");
            assert!(sorted(&ctx.ahead_events) && sorted(&ctx.behind_events));
        }

        #[test]
        fn names_are_case_insensitive() {
            let mut ctx = context();
            ctx.upsert_event(Event::new("Launch", base() + TimeDelta::days(1)));
            assert!(ctx.has_event_name("launch"));
            assert!(ctx.has_event_name("LAUNCH"));
            assert!(!ctx.has_event_name("lunch"));
        }

        #[test]
        fn distances_stay_stale_until_rebuild() {
            let mut ctx = context();
            ctx.upsert_event(Event::new("crossing", base() + TimeDelta::days(1)));
            ctx.now = now_in_zone(base() + TimeDelta::days(2), "UTC".to_string());

            assert_eq!(ctx.ahead_events.len(), 1);
            assert_eq!(ctx.ahead_events[0].distance, "1 day ahead");

            ctx.rebuild_event_positions();
            assert!(ctx.ahead_events.is_empty());
            assert_eq!(ctx.behind_events[0].distance, "1 day behind");
        }

        #[test]
        fn rebuild_is_idempotent_and_keeps_invariants() {
            let mut ctx = context();
            for (name, hours) in [("a", -30), ("b", 5), ("c", -1), ("d", 48), ("e", 0)] {
                ctx.upsert_event(Event::new(name, base() + TimeDelta::hours(hours)));
            }
            ctx.now = now_in_zone(base() + TimeDelta::hours(6), "UTC".to_string());

            ctx.rebuild_event_positions();
            let once = ctx.clone();
            ctx.rebuild_event_positions();
            assert_eq!(ctx, once);

            let now = ctx.now.timestamp;
            assert!(ctx.behind_events.iter().all(|e| e.at < now));
            assert!(ctx.ahead_events.iter().all(|e| e.at >= now));
            assert!(sorted(&ctx.behind_events) && sorted(&ctx.ahead_events));
            assert_eq!(ctx.ahead_events.len(), 1);
        }

        #[test]
        fn remove_prunes_sequences() {
            let mut ctx = context();
            ctx.upsert_event(Event::new("a", base() - TimeDelta::days(1)));
            ctx.upsert_event(Event::new("b", base() + TimeDelta::days(1)));
            ctx.put_sequence(Sequence {
                name: "cycle".into(),
                events: vec!["a".into(), "B".into()],
            });

            assert!(ctx.remove_event("b"));
            assert_eq!(ctx.sequences[0].events, ["a"]);
            assert!(!ctx.remove_event("b"));
        }

        #[test]
        fn put_replaces_by_name() {
            let mut ctx = context();
            let span = |name: &str, length: &str| Span {
                name: name.into(),
                from: "1 day behind".into(),
                to: "1 day ahead".into(),
                length: length.into(),
            };
            assert!(!ctx.put_span(span("Sprint", "2 days")));
            assert!(ctx.put_span(span("sprint", "3 days")));
            assert_eq!(ctx.spans.len(), 1);
            assert_eq!(ctx.spans[0].name, "sprint");
            assert_eq!(ctx.spans[0].length, "3 days");
        }
    }
}

pub mod parser {
    //! Tolerant reader for the time-context document.
    //!
    //! Parsing strategy:
    //! - The document is scanned line by line; sections are found by exact heading text and
    //!   run until the next heading of the same or a higher level.
    //! - Tables skip their two header rows; cells split on unescaped `|`.
    //! - Structural problems are reported through the warning sink and the affected data is
    //!   dropped. Nothing here fails unless the strict entry point is used.

    use crate::clock::{FALLBACK_TIMEZONE, now_in_zone};
    use crate::core::*;
    use crate::dates::parse_absolute;
    use crate::errors::TemporalError;
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::{tag, take_till1},
        character::complete::{char, space0, space1},
        combinator::{map, rest},
        error::VerboseError,
        sequence::tuple,
    };
    use std::cell::RefCell;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse with the current time as the fallback `now`.
    pub fn parse_time_context(markdown: &str, warn: Option<&dyn Fn(&str)>) -> TimeContext {
        parse_time_context_at(markdown, Utc::now(), warn)
    }

    /// Parse the document; `fallback_at` seeds the `Now` snapshot when the section is missing.
    pub fn parse_time_context_at(
        markdown: &str,
        fallback_at: DateTime<Utc>,
        warn: Option<&dyn Fn(&str)>,
    ) -> TimeContext {
        let warn = |message: &str| {
            log::debug!("advisory: {message}");
            if let Some(sink) = warn {
                sink(message);
            }
        };
        let lines: Vec<&str> = markdown.lines().collect();
        let fallback_now = now_in_zone(fallback_at, FALLBACK_TIMEZONE.to_string());

        let now = match section_body(&lines, NOW_HEADING) {
            Some(body) => parse_now(body, fallback_now, &warn),
            None => {
                warn("Missing ## Now section. Using fallback NOW values.");
                fallback_now
            }
        };

        let behind_events = match section_body(&lines, BEHIND_HEADING) {
            Some(body) => parse_event_table(body, "behind", &warn),
            None => {
                warn("Missing ### Behind (Past) section.");
                vec![]
            }
        };

        let ahead_events = match section_body(&lines, AHEAD_HEADING) {
            Some(body) => parse_event_table(body, "ahead", &warn),
            None => {
                warn("Missing ### Ahead (Future) section.");
                vec![]
            }
        };

        let sequences = section_body(&lines, SEQUENCES_HEADING)
            .map(|body| parse_sequences(body, &warn))
            .unwrap_or_default();
        let spans = section_body(&lines, DURATIONS_HEADING)
            .map(|body| parse_span_table(body, &warn))
            .unwrap_or_default();

        TimeContext {
            now,
            behind_events,
            ahead_events,
            sequences,
            spans,
        }
    }

    /// Parse and hand back every advisory alongside the model.
    pub fn parse_with_warnings(markdown: &str, fallback_at: DateTime<Utc>) -> (TimeContext, Vec<String>) {
        let warnings = RefCell::new(Vec::new());
        let collect = |message: &str| warnings.borrow_mut().push(message.to_string());
        let context = parse_time_context_at(markdown, fallback_at, Some(&collect));
        (context, warnings.into_inner())
    }

    /// Hard-fail variant: any advisory becomes an error.
    pub fn parse_time_context_strict(
        markdown: &str,
        fallback_at: DateTime<Utc>,
    ) -> Result<TimeContext, TemporalError> {
        let (context, warnings) = parse_with_warnings(markdown, fallback_at);
        if warnings.is_empty() {
            Ok(context)
        } else {
            Err(TemporalError::MalformedDocument(warnings))
        }
    }

    /* ------------------------------- Sections ------------------------------- */

    fn heading_level(line: &str) -> Option<usize> {
        let trimmed = line.trim();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        (hashes > 0 && trimmed[hashes..].starts_with(' ')).then_some(hashes)
    }

    fn section_body<'a, 'b>(lines: &'a [&'b str], heading: &str) -> Option<&'a [&'b str]> {
        let level = heading_level(heading)?;
        let start = lines.iter().position(|line| line.trim() == heading)? + 1;
        let end = lines[start..]
            .iter()
            .position(|line| heading_level(line).is_some_and(|other| other <= level))
            .map_or(lines.len(), |offset| start + offset);
        Some(&lines[start..end])
    }

    /* --------------------------------- Now --------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// `- **key**: value`
    fn now_field(i: &str) -> PResult<'_, (&str, &str)> {
        map(
            tuple((
                char('-'),
                space1,
                tag("**"),
                take_till1(|c| c == '*'),
                tag("**"),
                char(':'),
                space0,
                rest,
            )),
            |(_, _, _, key, _, _, _, value)| (key, value),
        )(i)
    }

    fn parse_now(body: &[&str], fallback: Now, warn: &dyn Fn(&str)) -> Now {
        let mut fields: IndexMap<String, String> = IndexMap::new();
        for line in body {
            if let Ok((_, (key, value))) = now_field(line.trim()) {
                fields.insert(key.trim().to_lowercase(), value.to_string());
            }
        }
        let field = |key: &str| fields.get(key).filter(|value| !value.is_empty()).cloned();

        let timestamp = match field("timestamp") {
            Some(raw) => match parse_absolute(&raw) {
                Ok(at) => at,
                Err(_) => {
                    warn(&format!(
                        "Unparseable NOW timestamp '{raw}'. Using fallback NOW timestamp."
                    ));
                    fallback.timestamp
                }
            },
            None => fallback.timestamp,
        };

        Now {
            timestamp,
            weekday: field("weekday").unwrap_or(fallback.weekday),
            week: field("week").unwrap_or(fallback.week),
            quarter: field("quarter").unwrap_or(fallback.quarter),
            timezone: field("timezone").unwrap_or(fallback.timezone),
        }
    }

    /* -------------------------------- Tables -------------------------------- */

    fn table_rows<'a>(body: &[&'a str]) -> impl Iterator<Item = &'a str> {
        body.iter()
            .copied()
            .filter(|line| line.trim_start().starts_with('|'))
            .skip(2)
    }

    /// Cells between the outer pipes, trimmed, with `\|` unescaped.
    fn split_row(row: &str) -> Vec<String> {
        let mut cells = Vec::new();
        let mut current = String::new();
        let mut chars = row.trim().chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'|') => {
                    current.push('|');
                    chars.next();
                }
                '|' => cells.push(std::mem::take(&mut current)),
                other => current.push(other),
            }
        }
        cells.push(current);

        if cells.len() < 2 {
            return vec![];
        }
        cells.pop();
        cells.remove(0);
        cells.into_iter().map(|cell| cell.trim().to_string()).collect()
    }

    fn non_empty(cell: &str) -> Option<String> {
        (!cell.is_empty()).then(|| cell.to_string())
    }

    fn parse_event_table(body: &[&str], label: &str, warn: &dyn Fn(&str)) -> Vec<Event> {
        let mut events = Vec::new();
        for row in table_rows(body) {
            let cells = split_row(row);
            let [distance, name, kind, notes, iso, ..] = cells.as_slice() else {
                warn(&format!("Skipping malformed {label} row: {}", row.trim()));
                continue;
            };
            if name.is_empty() {
                warn(&format!("Skipping {label} row with empty event name."));
                continue;
            }
            let Ok(at) = parse_absolute(iso) else {
                warn(&format!(
                    "Skipping {label} row '{name}' with unparseable iso '{iso}'."
                ));
                continue;
            };
            events.push(Event {
                name: name.clone(),
                at,
                distance: distance.clone(),
                kind: non_empty(kind),
                notes: non_empty(notes),
            });
        }
        events
    }

    fn parse_span_table(body: &[&str], warn: &dyn Fn(&str)) -> Vec<Span> {
        let mut spans = Vec::new();
        for row in table_rows(body) {
            let cells = split_row(row);
            let [name, from, to, length, ..] = cells.as_slice() else {
                warn(&format!("Skipping malformed span row: {}", row.trim()));
                continue;
            };
            if name.is_empty() {
                warn("Skipping span row with empty name.");
                continue;
            }
            spans.push(Span {
                name: name.clone(),
                from: from.clone(),
                to: to.clone(),
                length: length.clone(),
            });
        }
        spans
    }

    /* ------------------------------- Sequences ------------------------------- */

    fn parse_sequences(body: &[&str], warn: &dyn Fn(&str)) -> Vec<Sequence> {
        let mut sequences = Vec::new();
        let mut idx = 0;
        while idx < body.len() {
            let line = body[idx].trim();
            idx += 1;
            let Some(name) = line.strip_prefix("### ") else {
                continue;
            };
            let name = name.trim();

            let mut chain = None;
            while idx < body.len() {
                let candidate = body[idx].trim();
                if candidate.is_empty() {
                    idx += 1;
                    continue;
                }
                if heading_level(candidate).is_some() {
                    break;
                }
                chain = Some(candidate);
                idx += 1;
                break;
            }

            match chain {
                Some(chain) => sequences.push(Sequence {
                    name: name.to_string(),
                    events: split_chain(chain),
                }),
                None => warn(&format!("Sequence '{name}' is missing a chain line.")),
            }
        }
        sequences
    }

    fn split_chain(chain: &str) -> Vec<String> {
        chain
            .split('→')
            .flat_map(|part| part.split("->"))
            .map(str::trim)
            .filter(|token| !token.is_empty() && *token != NOW_MARKER)
            .map(str::to_string)
            .collect()
    }

}

pub mod format {
    use super::core::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum RenderView {
        #[default]
        Full,
        Past,
        Ahead,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenderOptions {
        pub view: RenderView,
        /// Sequences and Durations; scratch pads leave them out.
        pub include_meta_sections: bool,
    }

    impl Default for RenderOptions {
        fn default() -> Self {
            Self {
                view: RenderView::Full,
                include_meta_sections: true,
            }
        }
    }

    impl RenderOptions {
        pub fn view(view: RenderView) -> Self {
            Self {
                view,
                ..Self::default()
            }
        }

        pub fn scratch() -> Self {
            Self {
                view: RenderView::Full,
                include_meta_sections: false,
            }
        }
    }

    pub fn render_time_context(context: &TimeContext, options: RenderOptions) -> String {
        let mut lines: Vec<String> = vec![TITLE_HEADING.into(), String::new()];
        lines.extend(render_now(&context.now));
        lines.extend([String::new(), TIMELINE_HEADING.into(), String::new()]);

        if matches!(options.view, RenderView::Full | RenderView::Past) {
            lines.extend([BEHIND_HEADING.into(), String::new()]);
            lines.extend(render_event_table(&context.behind_events));
            lines.push(String::new());
        }

        if matches!(options.view, RenderView::Full | RenderView::Ahead) {
            lines.extend([AHEAD_HEADING.into(), String::new()]);
            lines.extend(render_event_table(&context.ahead_events));
            lines.push(String::new());
        }

        if options.view == RenderView::Full && options.include_meta_sections {
            lines.extend([SEQUENCES_HEADING.into(), String::new()]);
            for sequence in &context.sequences {
                lines.push(format!("### {}", sequence.name));
                lines.push(sequence_with_now(sequence, context));
                lines.push(String::new());
            }

            lines.extend([
                DURATIONS_HEADING.into(),
                String::new(),
                SPAN_TABLE_HEADER.into(),
                SPAN_TABLE_RULE.into(),
            ]);
            for span in &context.spans {
                lines.push(format!(
                    "| {} | {} | {} | {} |",
                    escape_cell(&span.name),
                    escape_cell(&span.from),
                    escape_cell(&span.to),
                    escape_cell(&span.length)
                ));
            }
        }

        let mut out = lines.join("\n").trim_end().to_string();
        out.push('\n');
        out
    }

    fn render_now(now: &Now) -> Vec<String> {
        vec![
            NOW_HEADING.into(),
            format!("- **timestamp**: {}", format_iso(&now.timestamp)),
            format!("- **weekday**: {}", now.weekday),
            format!("- **week**: {}", now.week),
            format!("- **quarter**: {}", now.quarter),
            format!("- **timezone**: {}", now.timezone),
        ]
    }

    fn render_event_table(events: &[Event]) -> Vec<String> {
        let mut sorted: Vec<&Event> = events.iter().collect();
        sorted.sort_by_key(|event| event.at);

        let mut rows = vec![EVENT_TABLE_HEADER.to_string(), EVENT_TABLE_RULE.to_string()];
        rows.extend(sorted.into_iter().map(|event| {
            format!(
                "| {} | {} | {} | {} | {} |",
                escape_cell(&event.distance),
                escape_cell(&event.name),
                escape_cell(event.kind.as_deref().unwrap_or_default()),
                escape_cell(event.notes.as_deref().unwrap_or_default()),
                format_iso(&event.at)
            )
        }));
        rows
    }

    /// Chain with `[NOW]` before the first member that is unknown or not yet past.
    fn sequence_with_now(sequence: &Sequence, context: &TimeContext) -> String {
        let now = context.now.timestamp;
        let insert_at = sequence
            .events
            .iter()
            .position(|name| {
                !name.is_empty()
                    && context
                        .find_event(name)
                        .is_none_or(|event| event.at >= now)
            })
            .unwrap_or(sequence.events.len());

        let mut tokens: Vec<&str> = sequence.events.iter().map(String::as_str).collect();
        tokens.insert(insert_at, NOW_MARKER);
        tokens.join(CHAIN_SEPARATOR)
    }

    fn escape_cell(value: &str) -> String {
        value
            .replace('|', "\\|")
            .replace("\r\n", " ")
            .replace(['\r', '\n'], " ")
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::clock::now_in_zone;
        use chrono::{DateTime, TimeDelta, Utc};

        fn base() -> DateTime<Utc> {
            "2026-02-17T12:00:00Z".parse().unwrap()
        }

        fn context_with(events: &[(&str, i64)], chain: &[&str]) -> TimeContext {
            let mut ctx = TimeContext::empty(now_in_zone(base(), "UTC".to_string()));
            for (name, days) in events {
                ctx.upsert_event(Event::new(*name, base() + TimeDelta::days(*days)));
            }
            ctx.put_sequence(Sequence {
                name: "cycle".into(),
                events: chain.iter().map(|s| s.to_string()).collect(),
            });
            ctx
        }

        fn chain_line(ctx: &TimeContext) -> String {
            sequence_with_now(&ctx.sequences[0], ctx)
        }

        #[test]
        fn now_marker_between_past_and_future() {
            let ctx = context_with(&[("a", -1), ("b", 1)], &["a", "b"]);
            assert_eq!(chain_line(&ctx), "a → [NOW] → b");
        }

        #[test]
        fn now_marker_at_end_when_all_past() {
            let ctx = context_with(&[("a", -2), ("b", -1)], &["a", "b"]);
            assert_eq!(chain_line(&ctx), "a → b → [NOW]");
        }

        #[test]
        fn now_marker_at_start_when_all_future() {
            let ctx = context_with(&[("a", 1), ("b", 2)], &["a", "b"]);
            assert_eq!(chain_line(&ctx), "[NOW] → a → b");
        }

        #[test]
        fn now_marker_before_first_unknown_member() {
            let ctx = context_with(&[("a", -2), ("b", -1)], &["a", "ghost", "b"]);
            assert_eq!(chain_line(&ctx), "a → [NOW] → ghost → b");
        }

        #[test]
        fn views_filter_sections() {
            let ctx = context_with(&[("a", -1), ("b", 1)], &["a", "b"]);
            let past = render_time_context(&ctx, RenderOptions::view(RenderView::Past));
            assert!(past.contains(BEHIND_HEADING));
            assert!(!past.contains(AHEAD_HEADING));
            assert!(!past.contains(SEQUENCES_HEADING));

            let ahead = render_time_context(&ctx, RenderOptions::view(RenderView::Ahead));
            assert!(ahead.contains(AHEAD_HEADING));
            assert!(!ahead.contains(BEHIND_HEADING));
            assert!(!ahead.contains(DURATIONS_HEADING));
        }

        #[test]
        fn scratch_layout_omits_meta_sections() {
            let ctx = context_with(&[("a", 1)], &["a"]);
            let out = render_time_context(&ctx, RenderOptions::scratch());
            assert!(out.contains(AHEAD_HEADING));
            assert!(!out.contains(SEQUENCES_HEADING));
            assert!(!out.contains(DURATIONS_HEADING));
            assert!(out.ends_with("|-----|\n| 1 day ahead | a |  |  | 2026-02-18T12:00:00.000Z |\n"));
        }

        #[test]
        fn empty_document_layout_is_stable() {
            let ctx = TimeContext::empty(now_in_zone(base(), "UTC".to_string()));
            let expected = "# Time Context

## Now
- **timestamp**: 2026-02-17T12:00:00.000Z
- **weekday**: Tuesday
- **week**: 8 of 53
- **quarter**: Q1 2026
- **timezone**: UTC

## Timeline

### Behind (Past)

| distance | event | type | notes | iso |
|----------|-------|------|-------|-----|

### Ahead (Future)

| distance | event | type | notes | iso |
|----------|-------|------|-------|-----|

## Sequences

## Durations

| span | from | to | length |
|------|------|----|--------|
";
            assert_eq!(render_time_context(&ctx, RenderOptions::default()), expected);
        }

        #[test]
        fn cells_are_escaped_onto_one_line() {
            let mut ctx = TimeContext::empty(now_in_zone(base(), "UTC".to_string()));
            let mut event = Event::new("x", base() + TimeDelta::hours(2));
            event.notes = Some("line one\nline | two".into());
            ctx.upsert_event(event);
            let out = render_time_context(&ctx, RenderOptions::default());
            assert!(out.contains("| line one line \\| two |"));
            assert!(out.ends_with("|------|------|----|--------|\n"));
        }
    }
}

pub mod storage {
    //! Document persistence. The core reads and writes whole documents through
    //! `DocumentStore`; nothing is appended or patched in place.

    use crate::errors::{StoreError, TemporalError};
    use std::{
        fs,
        io::{self, Read, Write},
        path::{Path, PathBuf},
    };

    pub const TIME_FILE: &str = "time.md";
    pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";
    const SCRATCH_BASENAME: &str = "time-scratch";

    pub trait DocumentStore {
        /// Full document text; `StoreError::NotFound` when absent.
        fn read(&self, path: &Path) -> Result<String, StoreError>;

        /// Replace the whole document.
        fn write(&self, path: &Path, content: &str) -> Result<(), StoreError>;

        /// Delete the document; `Ok(false)` when there was nothing to delete.
        fn remove(&self, path: &Path) -> Result<bool, StoreError>;

        fn exists(&self, path: &Path) -> bool;
    }

    /// Filesystem store. With `no_follow` set, symlinks are refused and new files are private.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FsStore {
        no_follow: bool,
    }

    impl FsStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn no_follow() -> Self {
            Self { no_follow: true }
        }

        /// Non-unix fallback and `remove` check; unlinking never follows the link.
        fn guard(&self, path: &Path) -> Result<(), StoreError> {
            if !self.no_follow {
                return Ok(());
            }
            match fs::symlink_metadata(path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    Err(StoreError::SymlinkRefused(path.to_path_buf()))
                }
                _ => Ok(()),
            }
        }

        /// Open in one step; with `no_follow` on unix a symlink fails the open itself.
        fn open(&self, path: &Path, options: &mut fs::OpenOptions) -> Result<fs::File, StoreError> {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                if self.no_follow {
                    options.custom_flags(libc::O_NOFOLLOW).mode(0o600);
                }
            }
            #[cfg(not(unix))]
            {
                self.guard(path)?;
            }
            options.open(path).map_err(|err| self.open_error(path, err))
        }

        fn open_error(&self, path: &Path, source: io::Error) -> StoreError {
            #[cfg(unix)]
            {
                if self.no_follow && source.raw_os_error() == Some(libc::ELOOP) {
                    return StoreError::SymlinkRefused(path.to_path_buf());
                }
            }
            io_error(path, source)
        }
    }

    impl DocumentStore for FsStore {
        fn read(&self, path: &Path) -> Result<String, StoreError> {
            let mut file = self.open(path, fs::OpenOptions::new().read(true))?;
            let mut content = String::new();
            file.read_to_string(&mut content)
                .map_err(|err| io_error(path, err))?;
            Ok(content)
        }

        fn write(&self, path: &Path, content: &str) -> Result<(), StoreError> {
            let mut file = self.open(
                path,
                fs::OpenOptions::new().write(true).create(true).truncate(true),
            )?;
            file.write_all(content.as_bytes())
                .map_err(|err| io_error(path, err))?;
            log::debug!("wrote {} bytes to {:?}", content.len(), path);
            Ok(())
        }

        fn remove(&self, path: &Path) -> Result<bool, StoreError> {
            self.guard(path)?;
            match fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(io_error(path, err)),
            }
        }

        fn exists(&self, path: &Path) -> bool {
            fs::symlink_metadata(path).is_ok()
        }
    }

    fn io_error(path: &Path, source: io::Error) -> StoreError {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(path.to_path_buf())
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /* ----------------------------- Scratch pads ----------------------------- */

    /// Lowercase, collapse every run of non `[a-z0-9]` into one `-`, trim dashes.
    pub fn sanitize_label(input: &str) -> Result<String, TemporalError> {
        let mut out = String::new();
        for c in input.to_lowercase().chars() {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                out.push(c);
            } else if !out.ends_with('-') {
                out.push('-');
            }
        }
        let trimmed = out.trim_matches('-');
        if trimmed.is_empty() {
            Err(TemporalError::InvalidLabel(input.to_string()))
        } else {
            Ok(trimmed.to_string())
        }
    }

    pub fn scratch_file_path(dir: &Path, label: Option<&str>) -> Result<PathBuf, TemporalError> {
        let file_name = match label {
            None => format!("{SCRATCH_BASENAME}.md"),
            Some(label) => format!("{SCRATCH_BASENAME}-{}.md", sanitize_label(label)?),
        };
        Ok(dir.join(file_name))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn labels_are_sanitized() {
            assert_eq!(sanitize_label("My Plan!!").unwrap(), "my-plan");
            assert_eq!(sanitize_label("--Q3 / review--").unwrap(), "q3-review");
            assert!(matches!(
                sanitize_label("!!!"),
                Err(TemporalError::InvalidLabel(_))
            ));
        }

        #[test]
        fn scratch_paths_live_in_the_scratch_dir() {
            let dir = Path::new("/tmp");
            assert_eq!(
                scratch_file_path(dir, None).unwrap(),
                PathBuf::from("/tmp/time-scratch.md")
            );
            assert_eq!(
                scratch_file_path(dir, Some("Deep Work")).unwrap(),
                PathBuf::from("/tmp/time-scratch-deep-work.md")
            );
        }

        #[test]
        fn fs_store_round_trips_and_reports_missing() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("time.md");
            let store = FsStore::new();

            assert!(matches!(store.read(&path), Err(StoreError::NotFound(_))));
            store.write(&path, "# Time Context\n").expect("write");
            assert!(store.exists(&path));
            assert_eq!(store.read(&path).expect("read"), "# Time Context\n");
            assert!(store.remove(&path).expect("remove"));
            assert!(!store.remove(&path).expect("remove again"));
        }

        #[cfg(unix)]
        #[test]
        fn no_follow_store_refuses_symlinks() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let target = tmp.path().join("target.md");
            let link = tmp.path().join("time-scratch.md");
            fs::write(&target, "original").expect("write target");
            std::os::unix::fs::symlink(&target, &link).expect("symlink");

            let store = FsStore::no_follow();
            assert!(matches!(
                store.write(&link, "clobber"),
                Err(StoreError::SymlinkRefused(_))
            ));
            assert!(matches!(store.read(&link), Err(StoreError::SymlinkRefused(_))));
            assert_eq!(fs::read_to_string(&target).expect("read target"), "original");
            assert!(FsStore::new().read(&link).is_ok());
        }

        #[cfg(unix)]
        #[test]
        fn no_follow_store_creates_private_files() {
            use std::os::unix::fs::PermissionsExt;
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("pad.md");
            FsStore::no_follow().write(&path, "x").expect("write");
            let mode = fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        #[cfg(unix)]
        #[test]
        fn no_follow_open_refuses_dangling_symlink_in_one_step() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let target = tmp.path().join("planted.md");
            let link = tmp.path().join("time-scratch.md");
            std::os::unix::fs::symlink(&target, &link).expect("symlink");

            let store = FsStore::no_follow();
            let opened = store.open(
                &link,
                fs::OpenOptions::new().write(true).create(true).truncate(true),
            );
            assert!(matches!(opened, Err(StoreError::SymlinkRefused(_))));
            assert!(matches!(
                store.write(&link, "clobber"),
                Err(StoreError::SymlinkRefused(_))
            ));
            assert!(!target.exists());
        }
    }
}

pub mod commands {
    //! Command layer: load, validate, mutate, render, persist.
    //!
    //! Every command returns the text to print. Validation happens before the single write,
    //! so a failing command leaves the document untouched.

    use crate::clock::{build_now, validate_timezone};
    use crate::core::{Event, NOW_MARKER, Sequence, Span, TimeContext};
    use crate::dates::{parse_date_input, parse_event_date};
    use crate::distance::{format_distance, format_length};
    use crate::errors::{StoreError, TemporalError};
    use crate::format::{RenderOptions, RenderView, render_time_context};
    use crate::parser::parse_time_context_at;
    use crate::storage::{DocumentStore, scratch_file_path};
    use chrono::{DateTime, Utc};
    use std::path::{Path, PathBuf};

    /* ------------------------------- Options ------------------------------- */

    /// `--in`, `--on`, `--at`; exactly one is expected.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct WhenOptions {
        pub in_duration: Option<String>,
        pub on_date: Option<String>,
        pub at_datetime: Option<String>,
    }

    impl WhenOptions {
        fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TemporalError> {
            parse_event_date(
                self.in_duration.as_deref(),
                self.on_date.as_deref(),
                self.at_datetime.as_deref(),
                now,
            )
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct InitOptions {
        pub timezone: Option<String>,
        pub force: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct AddOptions {
        pub name: Option<String>,
        pub when: WhenOptions,
        pub kind: Option<String>,
        pub notes: Option<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct SpanOptions {
        pub name: Option<String>,
        pub from: Option<String>,
        pub to: Option<String>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ScratchAddOptions {
        pub name: Option<String>,
        pub when: WhenOptions,
        pub scratch: Option<String>,
    }

    /* ------------------------------- Session ------------------------------- */

    /// Everything one invocation needs: where documents live, what time it is, and where
    /// advisories go.
    pub struct Session<'a> {
        pub store: &'a dyn DocumentStore,
        /// Scratch pads go through their own store so they can refuse symlinks.
        pub scratch_store: &'a dyn DocumentStore,
        pub time_file: PathBuf,
        pub scratch_dir: PathBuf,
        pub clock: DateTime<Utc>,
        pub warn: &'a dyn Fn(&str),
    }

    impl Session<'_> {
        pub fn load(&self) -> Result<TimeContext, TemporalError> {
            let markdown = read_document(self.store, &self.time_file, "temporal init")?;
            log::debug!("loaded {:?} ({} bytes)", self.time_file, markdown.len());
            Ok(parse_time_context_at(&markdown, self.clock, Some(self.warn)))
        }

        fn save(&self, context: &TimeContext) -> Result<String, TemporalError> {
            let rendered = render_time_context(context, RenderOptions::default());
            self.store.write(&self.time_file, &rendered)?;
            Ok(rendered)
        }

        pub fn init(&self, options: InitOptions) -> Result<String, TemporalError> {
            if self.store.exists(&self.time_file) && !options.force {
                return Err(TemporalError::AlreadyInitialized(self.time_file.clone()));
            }
            let timezone = options.timezone.as_deref().map(validate_timezone).transpose()?;
            let context = TimeContext::empty(build_now(self.clock, timezone.as_deref()));
            self.save(&context)
        }

        /// Replace the `now` snapshot only. Event distances and partitions stay as they were
        /// until the next `refresh`.
        pub fn now(&self, timezone: Option<&str>) -> Result<String, TemporalError> {
            let explicit = timezone.map(validate_timezone).transpose()?;
            let mut context = self.load()?;
            let timezone = explicit.unwrap_or_else(|| context.now.timezone.clone());
            context.now = build_now(self.clock, Some(&timezone));
            self.save(&context)
        }

        pub fn add(&self, options: AddOptions) -> Result<String, TemporalError> {
            let name = required(
                options.name,
                "Missing event name. Usage: temporal add <event> (--in|--on|--at ...)",
            )?;
            let mut context = self.load()?;
            if context.has_event_name(&name) {
                return Err(TemporalError::DuplicateEvent(name));
            }
            let at = options.when.resolve(context.now.timestamp)?;

            let mut event = Event::new(name, at);
            event.kind = options.kind.as_deref().and_then(trimmed_cell);
            event.notes = options.notes.as_deref().and_then(trimmed_cell);
            let position = context.upsert_event(event);
            log::debug!("added event {position}");
            self.save(&context)
        }

        pub fn refresh(&self) -> Result<String, TemporalError> {
            let mut context = self.load()?;
            context.now = build_now(self.clock, Some(&context.now.timezone));
            context.rebuild_event_positions();
            self.save(&context)
        }

        pub fn show(&self, view: RenderView) -> Result<String, TemporalError> {
            let context = self.load()?;
            Ok(render_time_context(&context, RenderOptions::view(view)))
        }

        pub fn remove(&self, name: Option<String>) -> Result<String, TemporalError> {
            let name = required(name, "Missing event name. Usage: temporal remove <event>")?;
            let mut context = self.load()?;
            if !context.remove_event(&name) {
                let available = context.event_names_sorted();
                let available = if available.is_empty() {
                    "none".to_string()
                } else {
                    available.join(", ")
                };
                return Err(TemporalError::UnknownEvent { name, available });
            }
            self.save(&context)
        }

        pub fn seq(&self, name: Option<String>, events: Vec<String>) -> Result<String, TemporalError> {
            let name = required(
                name,
                "Missing sequence name. Usage: temporal seq <name> <event1> <event2> [...]",
            )?;
            let events: Vec<String> = events
                .into_iter()
                .map(|event| event.trim().to_string())
                .filter(|event| !event.is_empty())
                .collect();
            if events.len() < 2 {
                return Err(TemporalError::MissingArgument(
                    "Sequence requires at least 2 events.".to_string(),
                ));
            }
            if let Some(member) = events.iter().find(|event| !is_chain_safe(event)) {
                return Err(TemporalError::InvalidSequenceMember(member.clone()));
            }

            let mut context = self.load()?;
            let unknown: Vec<&str> = events
                .iter()
                .filter(|event| !context.has_event_name(event))
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                (self.warn)(&format!(
                    "Unknown events in sequence '{name}': {}",
                    unknown.join(", ")
                ));
            }

            context.put_sequence(Sequence { name, events });
            self.save(&context)
        }

        pub fn span(&self, options: SpanOptions) -> Result<String, TemporalError> {
            let name = required(
                options.name,
                "Missing span name. Usage: temporal span <name> --from <when> --to <when>",
            )?;
            let (Some(from), Some(to)) = (
                options.from.filter(|v| !v.is_empty()),
                options.to.filter(|v| !v.is_empty()),
            ) else {
                return Err(TemporalError::MissingArgument(
                    "span requires both --from and --to.".to_string(),
                ));
            };

            let mut context = self.load()?;
            let now = context.now.timestamp;
            let from = parse_date_input(&from, now)?;
            let to = parse_date_input(&to, now)?;
            if from > to {
                return Err(TemporalError::InvalidSpan);
            }

            context.put_span(Span {
                name,
                from: format_distance(from, now),
                to: format_distance(to, now),
                length: format_length((to - from).num_milliseconds()),
            });
            self.save(&context)
        }

        /* ---------------------------- Scratch pads ---------------------------- */

        fn scratch_path(&self, label: Option<&str>) -> Result<PathBuf, TemporalError> {
            scratch_file_path(&self.scratch_dir, label)
        }

        fn load_scratch(&self, path: &Path) -> Result<TimeContext, TemporalError> {
            let markdown = read_document(self.scratch_store, path, "temporal scratch")?;
            Ok(parse_time_context_at(&markdown, self.clock, Some(self.warn)))
        }

        fn save_scratch(&self, path: &Path, context: &TimeContext) -> Result<String, TemporalError> {
            let rendered = render_time_context(context, RenderOptions::scratch());
            self.scratch_store.write(path, &rendered)?;
            Ok(rendered)
        }

        /// Fresh pad, replacing whatever was there.
        pub fn scratch_create(&self, label: Option<&str>) -> Result<String, TemporalError> {
            let path = self.scratch_path(label)?;
            let context = TimeContext::empty(build_now(self.clock, None));
            self.save_scratch(&path, &context)
        }

        pub fn scratch_add(&self, options: ScratchAddOptions) -> Result<String, TemporalError> {
            let name = required(
                options.name,
                "Missing event name. Usage: temporal scratch add <event> (--in|--on|--at ...)",
            )?;
            let path = self.scratch_path(options.scratch.as_deref())?;
            let mut context = self.load_scratch(&path)?;
            if context.has_event_name(&name) {
                return Err(TemporalError::DuplicateScratchEvent(name));
            }
            let at = options.when.resolve(context.now.timestamp)?;
            context.upsert_event(Event::new(name, at));
            self.save_scratch(&path, &context)
        }

        pub fn scratch_show(&self, label: Option<&str>) -> Result<String, TemporalError> {
            let path = self.scratch_path(label)?;
            let context = self.load_scratch(&path)?;
            Ok(render_time_context(&context, RenderOptions::scratch()))
        }

        pub fn scratch_clear(&self, label: Option<&str>) -> Result<String, TemporalError> {
            let path = self.scratch_path(label)?;
            if !self.scratch_store.remove(&path)? {
                (self.warn)(&format!(
                    "No scratch pad found at {}. Nothing to clear.",
                    path.display()
                ));
            }
            Ok(String::new())
        }
    }

    fn read_document(
        store: &dyn DocumentStore,
        path: &Path,
        hint: &'static str,
    ) -> Result<String, TemporalError> {
        store.read(path).map_err(|err| match err {
            StoreError::NotFound(path) => TemporalError::DocumentNotFound { path, hint },
            other => TemporalError::Store(other),
        })
    }

    /// Table cells are trimmed on read, so store them trimmed.
    fn trimmed_cell(value: &str) -> Option<String> {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Chain lines split on the arrows and drop the marker.
    fn is_chain_safe(name: &str) -> bool {
        !name.contains('→') && !name.contains("->") && name != NOW_MARKER
    }

    fn required(value: Option<String>, message: &str) -> Result<String, TemporalError> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| TemporalError::MissingArgument(message.to_string()))
    }

}

pub use format::{RenderOptions, RenderView, render_time_context};
pub use parser::{parse_time_context, parse_time_context_at};
