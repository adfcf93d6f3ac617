//! A routing-oriented scanner for InfluxDB Line Protocol
//! <https://docs.influxdata.com/influxdb/v1/write_protocols/line_protocol_reference/>
//!
//! The proxy never rewrites a point: it only needs the measurement and the tag set of every line
//! to decide where the line goes, and the byte range of the line to forward it verbatim. Field
//! values and timestamps are therefore not parsed.
//!
//! Line splitting follows the Go `scanLine` rules (escapes, quoted field strings) so that the
//! proxy agrees with the database on where one point ends and the next begins.
use std::{fmt, ops::Range};

use snafu::Snafu;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("missing measurement"))]
    MissingMeasurement,

    #[snafu(display("missing fields"))]
    MissingFields,

    #[snafu(display("missing tag key"))]
    MissingTagKey,

    #[snafu(display("missing tag value"))]
    MissingTagValue,

    #[snafu(display("invalid tag format"))]
    InvalidTagFormat,

    #[snafu(display("duplicate tags"))]
    DuplicateTags,

    #[snafu(display("tags is empty"))]
    TagsEmpty,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An unescaped tag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A line of the write payload, addressed by route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub db: String,
    pub measurement: String,
    /// Sorted by key
    pub tags: Vec<Tag>,
    /// The line within the payload, including its newline when present
    pub range: Range<usize>,
}

impl Point {
    /// The value of `key`, if the point has that tag
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }

    /// The bytes of this point's line in `payload`
    pub fn line<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.range.clone()]
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.measurement)?;
        for tag in &self.tags {
            write!(f, ",{}={}", tag.key, tag.value)?;
        }
        Ok(())
    }
}

/// Scan every point of `payload` for database `db`, handing them to `emit` in batches
///
/// Every batch holds exactly `batch_size` points except the last one, which is always emitted,
/// even when empty. A zero `batch_size` is treated as one. The first malformed line stops the
/// scan and its error is returned; batches emitted before it are not retracted.
pub fn parse_points<F>(db: &str, payload: &[u8], batch_size: usize, mut emit: F) -> Result<()>
where
    F: FnMut(Vec<Point>),
{
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);

    for (number, range) in split_lines(payload).enumerate() {
        let Some(key) = scan_point(payload, range.clone()).inspect_err(|e| {
            debug!(
                line = number + 1,
                content = %String::from_utf8_lossy(&payload[range.clone()]),
                error = %e,
                "invalid line protocol"
            );
        })?
        else {
            continue;
        };

        batch.push(Point {
            db: db.to_string(),
            measurement: key.measurement,
            tags: key.tags,
            range,
        });
        if batch.len() == batch_size {
            emit(std::mem::replace(
                &mut batch,
                Vec::with_capacity(batch_size),
            ));
        }
    }

    emit(batch);
    Ok(())
}

/// Scan all points of `payload` into one vector
pub fn parse_all(db: &str, payload: &[u8]) -> Result<Vec<Point>> {
    let mut points = vec![];
    parse_points(db, payload, usize::MAX, |batch| points.extend(batch))?;
    Ok(points)
}

/// Split `payload` into line ranges, each including its terminating newline
///
/// A newline only ends a line outside of a quoted field string; `\` escapes the byte after it.
fn split_lines(payload: &[u8]) -> impl Iterator<Item = Range<usize>> + '_ {
    let mut start = 0;
    std::iter::from_fn(move || {
        if start >= payload.len() {
            return None;
        }
        let end = scan_line(payload, start);
        let range = start..(end + 1).min(payload.len());
        start = range.end;
        Some(range)
    })
}

/// The index of the newline ending the line starting at `i`, or the payload length
fn scan_line(buf: &[u8], mut i: usize) -> usize {
    let mut quoted = false;
    let mut fields = false;

    // quotes only open a string when they follow an unmatched '=' of the field set
    let mut equals = 0;
    let mut commas = 0;

    while i < buf.len() {
        if buf[i] == b'\\' && i + 2 < buf.len() {
            i += 2;
            continue;
        }

        if buf[i] == b' ' {
            fields = true;
        }

        if fields {
            if !quoted && buf[i] == b'=' {
                i += 1;
                equals += 1;
                continue;
            } else if !quoted && buf[i] == b',' {
                i += 1;
                commas += 1;
                continue;
            } else if buf[i] == b'"' && equals > commas {
                i += 1;
                quoted = !quoted;
                continue;
            }
        }

        if buf[i] == b'\n' && !quoted {
            break;
        }

        i += 1;
    }
    i
}

#[derive(Debug)]
struct SeriesKey {
    measurement: String,
    tags: Vec<Tag>,
}

fn skip_whitespace(buf: &[u8], mut i: usize) -> usize {
    while i < buf.len() && matches!(buf[i], b' ' | b'\t' | 0) {
        i += 1;
    }
    i
}

/// Scan the measurement and tag set of the line at `range`
///
/// Returns `None` for blank and comment lines.
fn scan_point(payload: &[u8], range: Range<usize>) -> Result<Option<SeriesKey>> {
    let mut line = &payload[range];
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }

    let start = skip_whitespace(line, 0);
    if start >= line.len() || line[start] == b'#' {
        return Ok(None);
    }

    let (measurement_end, mut state) = scan_measurement(line, start)?;
    let mut i = measurement_end;
    let mut tags: Vec<(Range<usize>, Range<usize>)> = vec![];

    // i points at the byte after the separating comma while scanning tags
    if state == State::TagKey {
        i += 1;
        loop {
            let key_end = scan_tag_key(line, i)?;
            let value_start = key_end + 1;
            let (value_end, next) = scan_tag_value(line, value_start)?;
            tags.push((i..key_end, value_start..value_end));
            state = next;
            i = value_end + 1;
            if state == State::Fields {
                i = value_end;
                break;
            }
        }
    }
    debug_assert_eq!(state, State::Fields);

    if skip_whitespace(line, i) >= line.len() {
        return MissingFieldsSnafu.fail();
    }
    if tags.is_empty() {
        return TagsEmptySnafu.fail();
    }

    sort_and_check_tags(line, &mut tags)?;

    Ok(Some(SeriesKey {
        measurement: unescape(&line[start..measurement_end]),
        tags: tags
            .into_iter()
            .map(|(key, value)| Tag {
                key: unescape(&line[key]),
                value: unescape(&line[value]),
            })
            .collect(),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    TagKey,
    Fields,
}

/// Returns the end of the measurement, which is the index of the comma or space following it
fn scan_measurement(buf: &[u8], mut i: usize) -> Result<(usize, State)> {
    if i >= buf.len() || buf[i] == b',' {
        return MissingMeasurementSnafu.fail();
    }
    loop {
        i += 1;
        if i >= buf.len() {
            return MissingFieldsSnafu.fail();
        }
        if buf[i - 1] == b'\\' {
            continue;
        }
        match buf[i] {
            b',' => return Ok((i, State::TagKey)),
            b' ' => return Ok((i, State::Fields)),
            _ => {}
        }
    }
}

/// Returns the index of the `=` ending the tag key starting at `i`
fn scan_tag_key(buf: &[u8], mut i: usize) -> Result<usize> {
    if i >= buf.len() || matches!(buf[i], b' ' | b',' | b'=') {
        return MissingTagKeySnafu.fail();
    }
    loop {
        i += 1;
        if i >= buf.len() || (matches!(buf[i], b' ' | b',') && buf[i - 1] != b'\\') {
            return MissingTagValueSnafu.fail();
        }
        if buf[i] == b'=' && buf[i - 1] != b'\\' {
            return Ok(i);
        }
    }
}

/// Returns the index of the separator ending the tag value starting at `i`
fn scan_tag_value(buf: &[u8], mut i: usize) -> Result<(usize, State)> {
    if i >= buf.len() || matches!(buf[i], b',' | b' ') {
        return MissingTagValueSnafu.fail();
    }
    loop {
        i += 1;
        if i >= buf.len() {
            return MissingFieldsSnafu.fail();
        }
        if buf[i - 1] == b'\\' {
            continue;
        }
        match buf[i] {
            b'=' => return InvalidTagFormatSnafu.fail(),
            b',' => return Ok((i, State::TagKey)),
            b' ' => return Ok((i, State::Fields)),
            _ => {}
        }
    }
}

/// Sort tags by their raw key bytes, rejecting duplicate keys
fn sort_and_check_tags(buf: &[u8], tags: &mut [(Range<usize>, Range<usize>)]) -> Result<()> {
    let key = |t: &(Range<usize>, Range<usize>)| &buf[t.0.clone()];

    let mut sorted = true;
    for pair in tags.windows(2) {
        match key(&pair[0]).cmp(key(&pair[1])) {
            std::cmp::Ordering::Greater => {
                sorted = false;
                break;
            }
            std::cmp::Ordering::Equal => return DuplicateTagsSnafu.fail(),
            std::cmp::Ordering::Less => {}
        }
    }

    if !sorted {
        tags.sort_by(|a, b| key(a).cmp(key(b)));
        if tags.windows(2).any(|pair| key(&pair[0]) == key(&pair[1])) {
            return DuplicateTagsSnafu.fail();
        }
    }
    Ok(())
}

/// Remove the escaping of `,`, ` ` and `=`
fn unescape(raw: &[u8]) -> String {
    if !raw.contains(&b'\\') {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && i + 1 < raw.len() && matches!(raw[i + 1], b',' | b' ' | b'=') {
            out.push(raw[i + 1]);
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn parse(payload: &str) -> Result<Vec<Point>> {
        parse_all("db1", payload.as_bytes())
    }

    #[test]
    fn single_point() {
        let payload = "cpu,host=a,region=west usage=1 1590488773254420000\n";
        let points = parse(payload).unwrap();
        assert_eq!(points.len(), 1);

        let point = &points[0];
        assert_eq!(point.db, "db1");
        assert_eq!(point.measurement, "cpu");
        assert_eq!(
            point.tags,
            vec![Tag::new("host", "a"), Tag::new("region", "west")]
        );
        assert_eq!(point.range, 0..payload.len());
        assert_eq!(point.line(payload.as_bytes()), payload.as_bytes());
        assert_eq!(point.tag_value("region"), Some("west"));
        assert_eq!(point.to_string(), "db1.cpu,host=a,region=west");
    }

    #[test]
    fn ranges_cover_lines() {
        let payload = "m,t=1 f=1\n\n# comment\n  m2,t=2 f=2 100\nm3,t=3 f=3";
        let points = parse(payload).unwrap();
        let lines = points
            .iter()
            .map(|p| std::str::from_utf8(p.line(payload.as_bytes())).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(lines, vec!["m,t=1 f=1\n", "  m2,t=2 f=2 100\n", "m3,t=3 f=3"]);
        assert_eq!(points[1].measurement, "m2");
    }

    #[test]
    fn newline_inside_quoted_field_does_not_split() {
        let payload = "m,t=1 s=\"a\nb\",f=2\nm,t=2 f=1\n";
        let points = parse(payload).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].line(payload.as_bytes()), b"m,t=1 s=\"a\nb\",f=2\n");
    }

    #[test]
    fn escapes_are_removed() {
        let points = parse(r"my\ cpu,ho\,st=a\=b\ c f=1").unwrap();
        assert_eq!(points[0].measurement, "my cpu");
        assert_eq!(points[0].tags, vec![Tag::new("ho,st", "a=b c")]);
    }

    #[test]
    fn unsorted_tags_parse_like_sorted() {
        let sorted = parse("m,a=1,b=2,c=3 f=1").unwrap();
        let unsorted = parse("m,c=3,a=1,b=2 f=1").unwrap();
        assert_eq!(sorted[0].tags, unsorted[0].tags);
    }

    #[test]
    fn errors() {
        let cases = [
            (",t=1 f=1", Error::MissingMeasurement),
            ("cpu", Error::MissingFields),
            ("cpu,t=1", Error::MissingFields),
            ("cpu,t=1 ", Error::MissingFields),
            ("cpu, f=1", Error::MissingTagKey),
            ("cpu,=1 f=1", Error::MissingTagKey),
            ("cpu,t f=1", Error::MissingTagValue),
            ("cpu,t= f=1", Error::MissingTagValue),
            ("cpu,t=a=b f=1", Error::InvalidTagFormat),
            ("cpu,t=1,t=2 f=1", Error::DuplicateTags),
            ("cpu,z=1,t=2,z=3 f=1", Error::DuplicateTags),
            ("cpu f=1", Error::TagsEmpty),
        ];
        for (line, expected) in cases {
            assert_eq!(parse(line).unwrap_err(), expected, "line: {line}");
        }
    }

    #[test]
    fn error_stops_the_scan() {
        let mut batches = vec![];
        let result = parse_points("db1", b"m,t=1 f=1\nbad\nm,t=2 f=1\n", 1, |b| {
            batches.push(b)
        });
        assert_matches!(result, Err(Error::MissingFields));
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn trailing_batch_is_always_emitted() {
        let mut sizes = vec![];
        parse_points("db1", b"m,t=1 f=1\nm,t=2 f=1\n", 2, |b| sizes.push(b.len())).unwrap();
        assert_eq!(sizes, vec![2, 0]);

        let mut sizes = vec![];
        parse_points("db1", b"", 2, |b| sizes.push(b.len())).unwrap();
        assert_eq!(sizes, vec![0]);
    }

    proptest! {
        #[test]
        fn batches_split_evenly(n in 0usize..200, batch_size in 1usize..50) {
            let payload = "m,t=1 f=1\n".repeat(n);
            let mut sizes = vec![];
            parse_points("db1", payload.as_bytes(), batch_size, |b| {
                for p in &b {
                    assert_eq!(p.line(payload.as_bytes()), b"m,t=1 f=1\n");
                }
                sizes.push(b.len())
            })
            .unwrap();

            prop_assert_eq!(sizes.len(), n / batch_size + 1);
            prop_assert!(sizes[..n / batch_size].iter().all(|s| *s == batch_size));
            prop_assert_eq!(*sizes.last().unwrap(), n % batch_size);
        }

        #[test]
        fn tag_order_does_not_matter(
            keys in proptest::collection::btree_set("[a-z]{1,8}", 1..6),
            rotate in 0usize..6,
        ) {
            let keys = keys.into_iter().collect::<Vec<_>>();
            let mut rotated = keys.clone();
            let len = rotated.len();
            rotated.rotate_left(rotate % len);

            let line = |keys: &[String]| {
                let tags = keys.iter().map(|k| format!("{k}=v{k}")).collect::<Vec<_>>();
                format!("m,{} f=1", tags.join(","))
            };
            let a = parse(&line(&keys)).unwrap();
            let b = parse(&line(&rotated)).unwrap();
            prop_assert_eq!(&a[0].tags, &b[0].tags);
        }

        #[test]
        fn never_panics(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = parse_all("db1", &payload);
        }
    }
}
