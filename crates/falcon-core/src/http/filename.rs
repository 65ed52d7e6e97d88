//! Output filename derivation: Content-Disposition, URL path, sanitization.

const DEFAULT_FILENAME: &str = "download.bin";
const NAME_MAX: usize = 255;

/// Derive a safe local filename for a download.
///
/// Preference order: `filename*` (RFC 5987), `filename` from the
/// Content-Disposition header, then the last URL path segment. The result is
/// sanitized for Linux filesystems; an unusable candidate falls back to
/// `download.bin`.
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };
    let sanitized = sanitize(&raw);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Filename from a Content-Disposition value. `filename*` wins over
/// `filename`; quoted values are unescaped; RFC 5987 values are
/// percent-decoded.
fn disposition_filename(value: &str) -> Option<String> {
    let mut plain: Option<String> = None;
    for param in value.split(';') {
        let (name, v) = match param.trim().split_once('=') {
            Some(p) => p,
            None => continue,
        };
        let name = name.trim().to_ascii_lowercase();
        let v = v.trim();
        if name == "filename*" {
            let rest = match v
                .strip_prefix("UTF-8''")
                .or_else(|| v.strip_prefix("utf-8''"))
            {
                Some(r) => r,
                None => continue,
            };
            let decoded = percent_decode(rest);
            if !decoded.is_empty() {
                return Some(decoded);
            }
        } else if name == "filename" {
            let unquoted = if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
                unescape_quoted(&v[1..v.len() - 1])
            } else {
                v.to_string()
            };
            if !unquoted.is_empty() {
                plain = Some(unquoted);
            }
        }
    }
    plain
}

fn filename_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let segment = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    percent_decode_opt(segment)
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let h = bytes.next().and_then(hex_digit);
            let l = bytes.next().and_then(hex_digit);
            match (h, l) {
                (Some(high), Some(low)) => out.push((high << 4) | low),
                _ => out.push(b'%'),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn percent_decode_opt(s: &str) -> Option<String> {
    let decoded = percent_decode(s);
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Replace path separators, NUL, control characters, and whitespace with
/// `_`, collapse runs, trim edge dots/spaces, and cap at NAME_MAX bytes.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;
    for c in name.chars() {
        let mapped = if c == '\0' || c == '/' || c == '\\' || c.is_control() || c == ' ' || c == '\t'
        {
            '_'
        } else {
            c
        };
        if mapped == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(mapped);
            prev_underscore = false;
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_' || c == ' ');
    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_path() {
        assert_eq!(
            derive_filename("https://example.com/a/b/archive.zip", None),
            "archive.zip"
        );
        assert_eq!(
            derive_filename("https://example.com/f.zip?token=abc", None),
            "f.zip"
        );
    }

    #[test]
    fn from_disposition_quoted_and_token() {
        assert_eq!(
            derive_filename("https://example.com/", Some("attachment; filename=\"report.pdf\"")),
            "report.pdf"
        );
        assert_eq!(
            derive_filename("https://example.com/x", Some("attachment; filename=plain.bin")),
            "plain.bin"
        );
    }

    #[test]
    fn disposition_overrides_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/wrong.zip",
                Some("attachment; filename=\"right.tar.gz\"")
            ),
            "right.tar.gz"
        );
    }

    #[test]
    fn rfc5987_wins_over_plain() {
        assert_eq!(
            derive_filename(
                "https://example.com/x",
                Some("attachment; filename=\"fallback.bin\"; filename*=UTF-8''caf%C3%A9.txt")
            ),
            "café.txt"
        );
    }

    #[test]
    fn sanitizes_separators_and_controls() {
        assert_eq!(
            derive_filename("https://example.com/x", Some("attachment; filename=\"a/b\\\\c.txt\"")),
            "a_b_c.txt"
        );
    }

    #[test]
    fn fallback_when_nothing_usable() {
        assert_eq!(derive_filename("https://example.com/", None), "download.bin");
        assert_eq!(derive_filename("https://example.com/..", None), "download.bin");
    }

    #[test]
    fn percent_encoded_url_segment_is_decoded() {
        assert_eq!(
            derive_filename("https://example.com/my%20file.iso", None),
            "my_file.iso"
        );
    }
}
