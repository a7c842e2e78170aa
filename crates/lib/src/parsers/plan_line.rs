//! Tokenizer for partition plan lines using nom combinators.
//!
//! Fields are separated by unescaped whitespace; a backslash escapes the
//! following character, which is how partition names carry spaces.

use nom::{
    bytes::complete::escaped,
    character::complete::{anychar, multispace1, none_of},
    combinator::all_consuming,
    multi::separated_list1,
    IResult, Parser,
};

/// One raw (still-escaped) field: a run of non-separator characters where
/// `\` escapes whatever follows it.
fn field(input: &str) -> IResult<&str, &str> {
    escaped(none_of(" \t\\"), '\\', anychar).parse(input)
}

fn fields(input: &str) -> IResult<&str, Vec<&str>> {
    all_consuming(separated_list1(multispace1, field)).parse(input)
}

/// Remove the escaping backslashes from a raw field.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape a field value so [`split_fields`] reads it back verbatim.
pub(crate) fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ' ' | '\t' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Split a plan line into unescaped fields.
pub(crate) fn split_fields(line: &str) -> Result<Vec<String>, String> {
    let line = line.trim();
    let (_, raw) = fields(line).map_err(|_| format!("unparseable entry: {line:?}"))?;
    Ok(raw.into_iter().map(unescape).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_plain() {
        assert_eq!(
            split_fields("1 root ext4").unwrap(),
            vec!["1", "root", "ext4"]
        );
    }

    #[test]
    fn test_split_collapses_runs_of_whitespace() {
        assert_eq!(
            split_fields("1\t root   ext4").unwrap(),
            vec!["1", "root", "ext4"]
        );
    }

    #[test]
    fn test_split_escaped_space() {
        assert_eq!(
            split_fields(r"1 My\ Data ext4").unwrap(),
            vec!["1", "My Data", "ext4"]
        );
    }

    #[test]
    fn test_split_escaped_backslash() {
        assert_eq!(split_fields(r"a\\b c").unwrap(), vec![r"a\b", "c"]);
    }

    #[test]
    fn test_split_rejects_dangling_escape() {
        assert!(split_fields("name\\").is_err());
    }

    #[test]
    fn test_escape_roundtrip() {
        for v in ["plain", "with space", r"back\slash", "tab\there", "a b c"] {
            let escaped = escape_field(v);
            let fields = split_fields(&escaped).unwrap();
            assert_eq!(fields, vec![v.to_owned()], "via {escaped:?}");
        }
    }
}
