//! The replication key/value list grammar (spec §6.5).
//!
//! A `kvlist` is an ordered, named list of typed atoms:
//!
//! ```text
//! kvlist  := "%(" (pair (SP pair)*)? ")"
//! pair    := key SP value
//! value   := number | atom | string | literal | array | kvlist
//! array   := "%[" (value (SP value)*)? "]"
//! literal := "{" digit+ "}" <exactly that many raw bytes>
//! string  := '"' ... '"'   (backslash-escaped)
//! atom    := bare token with no whitespace, parens or brackets
//! ```
//!
//! `literal` is how the log embeds raw message bytes inline without
//! worrying about their content colliding with the grammar's own
//! delimiters (the byte count is explicit, so embedded CR/LF or `%(` are
//! just data). Parsing therefore happens over `&[u8]`, never `&str`: a
//! literal can carry arbitrary binary content.

use anyhow::{bail, Context, Error};
use nom::branch::alt;
use nom::bytes::complete::{tag, take, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt, recognize};
use nom::multi::separated_list0;
use nom::sequence::{delimited, preceded, separated_pair};
use nom::IResult;

/// One value in a kvlist.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Num(i64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Atom>),
    KvList(KvList),
}

impl Atom {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Atom::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<i64> {
        match self {
            Atom::Num(n) => Some(*n),
            Atom::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<&[u8]> {
        match self {
            Atom::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Atom]> {
        match self {
            Atom::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_kvlist(&self) -> Option<&KvList> {
        match self {
            Atom::KvList(kv) => Some(kv),
            _ => None,
        }
    }
}

/// An ordered, named list of atoms. Keys are case-sensitive on the wire;
/// callers that need case-insensitive lookup normalize first (reindex
/// upper-cases verb names per spec §4.6 step 2d, not keys in general).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KvList(pub Vec<(String, Atom)>);

impl KvList {
    pub fn new() -> Self {
        KvList(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: Atom) -> &mut Self {
        self.0.push((key.into(), value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Atom> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Atom::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(Atom::as_num).map(|n| n as u32)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Atom::as_num).map(|n| n as u64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Atom::as_num)
    }

    pub fn get_array(&self, key: &str) -> Option<&[Atom]> {
        self.get(key).and_then(Atom::as_array)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Atom)> {
        self.0.iter()
    }
}

/// A fully parsed command line: `<ts> <VERB> <kvlist>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub ts: i64,
    pub verb: String,
    pub kvlist: KvList,
}

fn ws(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|c| c == b' ')(i)
}

fn parse_i64(i: &[u8]) -> IResult<&[u8], i64> {
    map_res(
        recognize(preceded(opt(char('-')), digit1)),
        |bytes: &[u8]| std::str::from_utf8(bytes).unwrap().parse::<i64>(),
    )(i)
}

fn parse_token(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(|c: u8| {
        !matches!(c, b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b'[' | b']' | b'"')
    })(i)
}

fn parse_quoted(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (mut rest, _) = char('"')(i)?;
    let mut out = Vec::new();
    loop {
        if rest.is_empty() {
            return Err(nom::Err::Error(nom::error::Error::new(
                rest,
                nom::error::ErrorKind::Eof,
            )));
        }
        match rest[0] {
            b'"' => {
                rest = &rest[1..];
                break;
            }
            b'\\' if rest.len() > 1 => {
                out.push(rest[1]);
                rest = &rest[2..];
            }
            c => {
                out.push(c);
                rest = &rest[1..];
            }
        }
    }
    Ok((rest, out))
}

fn parse_literal(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (i, _) = char('{')(i)?;
    let (i, len) = map_res(digit1, |b: &[u8]| std::str::from_utf8(b).unwrap().parse::<usize>())(i)?;
    let (i, _) = char('}')(i)?;
    let (i, data) = take(len)(i)?;
    Ok((i, data.to_vec()))
}

fn parse_value(i: &[u8]) -> IResult<&[u8], Atom> {
    alt((
        map(parse_kvlist, Atom::KvList),
        map(parse_array, Atom::Array),
        map(parse_literal, Atom::Bin),
        map(parse_quoted, |b| Atom::Str(String::from_utf8_lossy(&b).into_owned())),
        map(parse_token, |b| {
            let s = String::from_utf8_lossy(b).into_owned();
            match s.parse::<i64>() {
                Ok(n) => Atom::Num(n),
                Err(_) => Atom::Str(s),
            }
        }),
    ))(i)
}

fn parse_pair(i: &[u8]) -> IResult<&[u8], (String, Atom)> {
    map(
        separated_pair(parse_token, ws, parse_value),
        |(k, v)| (String::from_utf8_lossy(k).into_owned(), v),
    )(i)
}

pub fn parse_kvlist(i: &[u8]) -> IResult<&[u8], KvList> {
    map(
        delimited(
            tag("%("),
            separated_list0(ws, parse_pair),
            char(')'),
        ),
        KvList,
    )(i)
}

fn parse_array(i: &[u8]) -> IResult<&[u8], Vec<Atom>> {
    delimited(tag("%["), separated_list0(ws, parse_value), char(']'))(i)
}

/// Parses one `<ts> <VERB> <kvlist>` command, stopping right after the
/// trailing `\r\n`. Returns the unconsumed remainder of the buffer.
pub fn parse_command(i: &[u8]) -> IResult<&[u8], Command> {
    let (i, ts) = parse_i64(i)?;
    let (i, _) = ws(i)?;
    let (i, verb) = parse_token(i)?;
    let (i, _) = ws(i)?;
    let (i, kvlist) = parse_kvlist(i)?;
    let (i, _) = tag("\r\n")(i)?;
    Ok((
        i,
        Command {
            ts,
            verb: String::from_utf8_lossy(verb).into_owned(),
            kvlist,
        },
    ))
}

/// Parses the mandatory chunk-header comment line and returns its timestamp.
pub fn parse_chunk_header(i: &[u8]) -> IResult<&[u8], i64> {
    let (i, _) = tag("# cyrus backup: chunk start ")(i)?;
    let (i, ts) = parse_i64(i)?;
    let (i, _) = tag("\r\n")(i)?;
    Ok((i, ts))
}

pub fn is_comment_line(line: &[u8]) -> bool {
    line.first() == Some(&b'#')
}

/// Splits off one line (through `\r\n`) that may contain embedded literal
/// byte blobs; used by callers (reindex) that want to know where one
/// record ends before handing it to [`parse_command`].
pub fn next_record_end(buf: &[u8]) -> Option<usize> {
    let mut pos = 0;
    let mut in_quotes = false;
    while pos < buf.len() {
        if in_quotes {
            // Mirrors `parse_quoted`: a backslash escapes the following
            // byte verbatim, so a quoted `\"`, `\{`, or embedded `\r`/`\n`
            // never ends the string or is mistaken for literal/CRLF syntax.
            match buf[pos] {
                b'\\' if pos + 1 < buf.len() => pos += 2,
                b'"' => {
                    in_quotes = false;
                    pos += 1;
                }
                _ => pos += 1,
            }
            continue;
        }
        match buf[pos] {
            b'"' => {
                in_quotes = true;
                pos += 1;
            }
            b'{' => {
                let start = pos + 1;
                let end = buf[start..].iter().position(|&c| c == b'}')? + start;
                let len: usize = std::str::from_utf8(&buf[start..end]).ok()?.parse().ok()?;
                pos = end + 1 + len;
            }
            b'\r' if buf.get(pos + 1) == Some(&b'\n') => return Some(pos + 2),
            _ => pos += 1,
        }
    }
    None
}

pub fn format_command(ts: i64, verb: &str, kvlist: &KvList) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{ts} {verb} ").as_bytes());
    format_kvlist(kvlist, &mut out);
    out.extend_from_slice(b"\r\n");
    out
}

/// Serializes a single value on its own, the way a caller that only has an
/// `Atom` in hand (e.g. a `FLAGS` array pulled out of a kvlist) formats it
/// back to its wire text without rebuilding a whole command line.
pub fn format_atom(atom: &Atom) -> Vec<u8> {
    let mut out = Vec::new();
    format_value(atom, &mut out);
    out
}

fn format_kvlist(kv: &KvList, out: &mut Vec<u8>) {
    out.extend_from_slice(b"%(");
    for (idx, (key, value)) in kv.0.iter().enumerate() {
        if idx > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(key.as_bytes());
        out.push(b' ');
        format_value(value, out);
    }
    out.push(b')');
}

fn format_value(value: &Atom, out: &mut Vec<u8>) {
    match value {
        Atom::Num(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Atom::Str(s) if s.is_empty() || s.bytes().any(|c| c.is_ascii_whitespace() || c == b'(') => {
            out.push(b'"');
            for c in s.bytes() {
                if c == b'"' || c == b'\\' {
                    out.push(b'\\');
                }
                out.push(c);
            }
            out.push(b'"');
        }
        Atom::Str(s) => out.extend_from_slice(s.as_bytes()),
        Atom::Bin(b) => {
            out.extend_from_slice(format!("{{{}}}", b.len()).as_bytes());
            out.extend_from_slice(b);
        }
        Atom::Array(items) => {
            out.extend_from_slice(b"%[");
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b' ');
                }
                format_value(item, out);
            }
            out.push(b']');
        }
        Atom::KvList(kv) => format_kvlist(kv, out),
    }
}

/// Parses exactly one command out of `buf`, requiring the whole slice to
/// be consumed. Used once a caller has already located the record's end
/// byte (via [`next_record_end`]).
pub fn parse_command_complete(buf: &[u8]) -> Result<Command, Error> {
    match parse_command(buf) {
        Ok((rest, cmd)) if rest.is_empty() => Ok(cmd),
        Ok((rest, _)) => bail!("trailing bytes after command ({} left)", rest.len()),
        Err(err) => Err(Error::msg(format!("malformed replication command - {err}")))
            .context("parsing kvlist command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mailbox_command() {
        let line = b"12345 MAILBOX %(UNIQUEID U1 MBOXNAME INBOX LAST_UID 0)\r\n";
        let end = next_record_end(line).unwrap();
        assert_eq!(end, line.len());
        let cmd = parse_command_complete(&line[..end]).unwrap();
        assert_eq!(cmd.ts, 12345);
        assert_eq!(cmd.verb, "MAILBOX");
        assert_eq!(cmd.kvlist.get_str("UNIQUEID"), Some("U1"));
        assert_eq!(cmd.kvlist.get_str("MBOXNAME"), Some("INBOX"));
        assert_eq!(cmd.kvlist.get_u32("LAST_UID"), Some(0));
    }

    #[test]
    fn round_trips_literal_payload_with_embedded_crlf() {
        let mut kv = KvList::new();
        kv.push("GUID", Atom::Str("a".repeat(40)));
        kv.push("PARTITION", Atom::Str("p".into()));
        kv.push("DATA", Atom::Bin(b"hello\r\nworld".to_vec()));
        let line = format_command(1, "MESSAGE", &kv);

        let end = next_record_end(&line).unwrap();
        assert_eq!(end, line.len());
        let cmd = parse_command_complete(&line[..end]).unwrap();
        assert_eq!(cmd.kvlist.get("DATA").unwrap().as_bin(), Some(&b"hello\r\nworld"[..]));
    }

    #[test]
    fn next_record_end_ignores_braces_and_crlf_inside_quotes() {
        let mut kv = KvList::new();
        kv.push("MBOXNAME", Atom::Str("weird {42} mailbox\r\nname".into()));
        let mut second = KvList::new();
        second.push("UNIQUEID", Atom::Str("U2".into()));
        let line = {
            let mut buf = format_command(1, "MAILBOX", &kv);
            buf.extend_from_slice(&format_command(2, "MAILBOX", &second));
            buf
        };

        let end = next_record_end(&line).unwrap();
        assert!(end < line.len(), "should split before the second command, not mid-quote");
        let cmd = parse_command_complete(&line[..end]).unwrap();
        assert_eq!(cmd.kvlist.get_str("MBOXNAME"), Some("weird {42} mailbox\r\nname"));

        let end2 = next_record_end(&line[end..]).unwrap();
        let cmd2 = parse_command_complete(&line[end..][..end2]).unwrap();
        assert_eq!(cmd2.kvlist.get_str("UNIQUEID"), Some("U2"));
    }

    #[test]
    fn parses_header_line() {
        let (rest, ts) = parse_chunk_header(b"# cyrus backup: chunk start 42\r\nnext").unwrap();
        assert_eq!(ts, 42);
        assert_eq!(rest, b"next");
    }

    #[test]
    fn skips_comment_lines() {
        assert!(is_comment_line(b"# a comment"));
        assert!(!is_comment_line(b"1 MAILBOX %()"));
    }

    #[test]
    fn parses_nested_records_array() {
        let line = b"1 MAILBOX %(UNIQUEID U1 RECORD %[%(UID 1 FLAGS %[\\Seen]) %(UID 2 FLAGS %[])])\r\n";
        let cmd = parse_command_complete(&line[..line.len()]).unwrap();
        let records = cmd.kvlist.get_array("RECORD").unwrap();
        assert_eq!(records.len(), 2);
        let first = records[0].as_kvlist().unwrap();
        assert_eq!(first.get_u32("UID"), Some(1));
    }
}
