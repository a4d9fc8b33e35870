use std::fmt;

use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};

/// author, committer or tagger identity with a timestamp
///
/// name and email are raw bytes: commits with an `encoding` header carry
/// them in that encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub name: BString,
    pub email: BString,
    /// seconds since the unix epoch
    pub time: i64,
    /// timezone offset east of utc, in minutes
    pub offset_minutes: i32,
}

impl Signature {
    pub fn new(
        name: impl Into<BString>,
        email: impl Into<BString>,
        time: i64,
        offset_minutes: i32,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            offset_minutes,
        }
    }

    /// signature stamped with the current time in utc
    pub fn now(name: impl Into<BString>, email: impl Into<BString>) -> Self {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::new(name, email, time, 0)
    }

    /// parse `Name <email> <seconds> <+HHMM>`
    pub fn parse(text: impl AsRef<[u8]>) -> Result<Self> {
        let text = text.as_ref();
        let invalid = || Error::InvalidSignature(text.to_str_lossy().into_owned());

        let open = text.find_byte(b'<').ok_or_else(invalid)?;
        let close = text[open..]
            .find_byte(b'>')
            .map(|i| open + i)
            .ok_or_else(invalid)?;

        let name = BString::from(text[..open].trim_end());
        let email = BString::from(&text[open + 1..close]);

        let when = text[close + 1..].to_str().map_err(|_| invalid())?;
        let mut when = when.split_whitespace();
        let time = when
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let offset = when.next().ok_or_else(invalid)?;
        let offset_minutes = parse_offset(offset).ok_or_else(invalid)?;

        Ok(Self {
            name,
            email,
            time,
            offset_minutes,
        })
    }

    /// append the exact bytes `parse` reads back
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name);
        out.extend_from_slice(b" <");
        out.extend_from_slice(&self.email);
        out.extend_from_slice(format!("> {} {}", self.time, self.format_offset()).as_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    fn format_offset(&self) -> String {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let abs = self.offset_minutes.unsigned_abs();
        format!("{}{:02}{:02}", sign, abs / 60, abs % 60)
    }
}

fn parse_offset(offset: &str) -> Option<i32> {
    let (sign, digits) = match offset.as_bytes().first()? {
        b'+' => (1, &offset[1..]),
        b'-' => (-1, &offset[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}

/// lossy for identities that are not utf-8
impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.time,
            self.format_offset()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_roundtrip() {
        let text = "A U Thor <author@example.com> 1112911993 -0700";
        let sig = Signature::parse(text).unwrap();
        assert_eq!(sig.name, "A U Thor");
        assert_eq!(sig.email, "author@example.com");
        assert_eq!(sig.time, 1112911993);
        assert_eq!(sig.offset_minutes, -420);
        assert_eq!(sig.to_string(), text);
        assert_eq!(sig.to_bytes(), text.as_bytes());
    }

    #[test]
    fn test_signature_latin1_name() {
        let text = b"Ren\xe9 <rene@example.com> 0 +0100";
        let sig = Signature::parse(text).unwrap();
        assert_eq!(sig.name, &b"Ren\xe9"[..]);
        assert_eq!(sig.to_bytes(), text);
    }

    #[test]
    fn test_signature_half_hour_offset() {
        let sig = Signature::new("x", "x@y", 0, 330);
        assert_eq!(sig.to_string(), "x <x@y> 0 +0530");
    }

    #[test]
    fn test_signature_rejects_malformed() {
        assert!(Signature::parse("no email 123 +0000").is_err());
        assert!(Signature::parse("n <e> notanumber +0000").is_err());
        assert!(Signature::parse("n <e> 123 0000").is_err());
        assert!(Signature::parse("n <e> 123").is_err());
    }
}
