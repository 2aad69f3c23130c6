//! Turns one line of FTP `LIST` output into a metadata record, tolerating
//! both Unix `ls -l` style and Windows `DIR` style listings.

use chrono::{Datelike, Local, TimeZone};

/// Bound on a listing entry's name, mirroring the `PATH_MAX`-scale buffers
/// the original C implementation used.
pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Directory,
    Link,
    Unknown,
}

impl ItemKind {
    pub fn base_mode(self) -> u32 {
        match self {
            ItemKind::File => 0o644,
            ItemKind::Directory => 0o755,
            ItemKind::Link => 0o777,
            ItemKind::Unknown => 0o644,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingItem {
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Dispatches on the first non-blank character: `d`/`-`/`l` is a Unix-style
/// line, a decimal digit is a Windows-style line, anything else is rejected.
pub fn parse_line(line: &str) -> Option<ListingItem> {
    let line = line.trim_start();
    let first = *line.as_bytes().first()?;
    match first {
        b'd' | b'-' | b'l' => parse_unix_line(line),
        b'0'..=b'9' => parse_windows_line(line),
        _ => None,
    }
}

/// Splits the first `n` whitespace-delimited tokens off `line`, returning
/// them alongside whatever remains (trimmed of the separating whitespace).
fn split_n_ws(line: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let bytes = line.as_bytes();
    let len = bytes.len();
    let mut idx = 0;
    let mut tokens = Vec::with_capacity(n);
    for _ in 0..n {
        while idx < len && bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        if idx >= len {
            return None;
        }
        let start = idx;
        while idx < len && !bytes[idx].is_ascii_whitespace() {
            idx += 1;
        }
        tokens.push(&line[start..idx]);
    }
    while idx < len && bytes[idx].is_ascii_whitespace() {
        idx += 1;
    }
    Some((tokens, &line[idx..]))
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

fn local_mtime(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<i64> {
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .map(|dt| dt.timestamp())
}

fn parse_unix_line(line: &str) -> Option<ListingItem> {
    let kind = match *line.as_bytes().first()? {
        b'd' => ItemKind::Directory,
        b'l' => ItemKind::Link,
        b'-' => ItemKind::File,
        _ => return None,
    };

    // mode, links, owner, group, size, month, day, time-or-year
    let (tokens, rest) = split_n_ws(line, 8)?;
    let size: u64 = tokens[4].parse().ok()?;
    let month_str = tokens[5];
    if month_str.len() < 3 {
        return None;
    }
    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(&month_str[..3]))?;
    let day: u32 = tokens[6].parse().ok()?;
    let time_or_year = tokens[7];

    let (year, hour, minute) = if let Some((h, m)) = time_or_year.split_once(':') {
        (Local::now().year(), h.parse::<u32>().ok()?, m.parse::<u32>().ok()?)
    } else {
        (time_or_year.parse::<i32>().ok()?, 0u32, 0u32)
    };

    let name_part = rest.split(" -> ").next().unwrap_or(rest).trim_end();
    if name_part.is_empty() {
        return None;
    }

    let mtime = local_mtime(year, month as u32 + 1, day, hour, minute)?;

    Some(ListingItem {
        name: truncate_name(name_part),
        kind,
        size,
        mtime,
        mode: kind.base_mode(),
    })
}

enum Meridiem {
    Am,
    Pm,
}

fn split_ampm(token: &str) -> (&str, Option<Meridiem>) {
    if token.len() >= 2 {
        let tail = &token[token.len() - 2..];
        if tail.eq_ignore_ascii_case("am") {
            return (&token[..token.len() - 2], Some(Meridiem::Am));
        }
        if tail.eq_ignore_ascii_case("pm") {
            return (&token[..token.len() - 2], Some(Meridiem::Pm));
        }
    }
    (token, None)
}

fn parse_windows_line(line: &str) -> Option<ListingItem> {
    // MM-DD-YY[YY]  HH:MM[AP]M  (<DIR>|size)  name
    let (tokens, rest) = split_n_ws(line, 3)?;

    let mut date_parts = tokens[0].split('-');
    let month: u32 = date_parts.next()?.parse().ok()?;
    let day: u32 = date_parts.next()?.parse().ok()?;
    let year_tok = date_parts.next()?;
    let raw_year: i32 = year_tok.parse().ok()?;
    let year = if year_tok.len() <= 2 {
        if raw_year < 50 { 2000 + raw_year } else { 1900 + raw_year }
    } else {
        raw_year
    };

    let (hm, meridiem) = split_ampm(tokens[1]);
    let mut hm_parts = hm.split(':');
    let mut hour: u32 = hm_parts.next()?.parse().ok()?;
    let minute: u32 = hm_parts.next()?.parse().ok()?;
    match meridiem {
        Some(Meridiem::Pm) if hour != 12 => hour += 12,
        Some(Meridiem::Am) if hour == 12 => hour = 0,
        _ => {}
    }

    let size_tok = tokens[2];
    let (kind, size) = if size_tok.eq_ignore_ascii_case("<dir>") {
        (ItemKind::Directory, 0)
    } else {
        (ItemKind::File, size_tok.parse().ok()?)
    };

    let name = rest.trim_end();
    if name.is_empty() {
        return None;
    }

    let mtime = local_mtime(year, month, day, hour, minute)?;

    Some(ListingItem {
        name: truncate_name(name),
        kind,
        size,
        mtime,
        mode: kind.base_mode(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_line() {
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn rejects_total_line() {
        assert!(parse_line("total 12").is_none());
    }

    #[test]
    fn parses_unix_directory() {
        let item = parse_line("drwxr-xr-x 2 u g 4096 Jan  1 12:00 dir").unwrap();
        assert_eq!(item.name, "dir");
        assert_eq!(item.kind, ItemKind::Directory);
        assert_eq!(item.size, 4096);
        assert_eq!(item.mode, 0o755);
    }

    #[test]
    fn parses_unix_file_with_year() {
        let item = parse_line("-rw-r--r-- 1 u g 1234 Jan  1  2019 file.txt").unwrap();
        assert_eq!(item.name, "file.txt");
        assert_eq!(item.kind, ItemKind::File);
        assert_eq!(item.size, 1234);
    }

    #[test]
    fn parses_unix_symlink_strips_target() {
        let item = parse_line("lrwxrwxrwx 1 u g 7 Jan  1 12:00 link -> target").unwrap();
        assert_eq!(item.name, "link");
        assert_eq!(item.kind, ItemKind::Link);
    }

    #[test]
    fn parses_unix_name_with_spaces() {
        let item = parse_line("-rw-r--r-- 1 u g 10 Jan  1 12:00 my file.txt").unwrap();
        assert_eq!(item.name, "my file.txt");
    }

    #[test]
    fn rejects_bad_month() {
        assert!(parse_line("-rw-r--r-- 1 u g 10 Zzz  1 12:00 file").is_none());
    }

    #[test]
    fn parses_windows_directory() {
        let item = parse_line("01-01-24  12:00PM       <DIR>          Data").unwrap();
        assert_eq!(item.name, "Data");
        assert_eq!(item.kind, ItemKind::Directory);
        assert_eq!(item.size, 0);
    }

    #[test]
    fn parses_windows_file_and_am_pm() {
        let item = parse_line("03-15-23  09:05AM             512 readme.txt").unwrap();
        assert_eq!(item.name, "readme.txt");
        assert_eq!(item.kind, ItemKind::File);
        assert_eq!(item.size, 512);
    }

    #[test]
    fn windows_two_digit_year_pivots_at_fifty() {
        let old = parse_line("01-01-92  12:00AM       <DIR>          old").unwrap();
        let new = parse_line("01-01-20  12:00AM       <DIR>          new").unwrap();
        assert!(old.mtime < new.mtime);
    }

    #[test]
    fn windows_noon_and_midnight_are_not_shifted_by_twelve() {
        let noon = parse_line("01-01-24  12:00PM       <DIR>          d").unwrap();
        let midnight = parse_line("01-01-24  12:00AM       <DIR>          d").unwrap();
        assert!(noon.mtime > midnight.mtime);
    }
}
