//! Domain names in the RFC 1035 section 3.1 wire encoding.
//!
//! DHCPv6 (RFC 8415 section 10) requires names to be stored uncompressed:
//! a sequence of length-prefixed labels closed by a zero-length label.
//! Compression pointers are never produced and never accepted.

use core::fmt;
use core::str::FromStr;

use crate::bytes::BytesIn;
use crate::Error;

pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

/// An absolute domain name, stored as its labels.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DomainName {
    labels: Vec<String>,
}

impl DomainName {
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Parse one name, consuming up to and including its zero-length label.
    pub fn parse(bytes: &mut BytesIn<'_>) -> Result<Self, Error> {
        let mut labels = Vec::new();
        let mut wire_len = 0;

        loop {
            if bytes.is_empty() {
                return Err(Error::Unterminated);
            }

            let label_len = bytes.byte()? as usize;
            wire_len += 1 + label_len;
            if wire_len > MAX_NAME_LEN {
                return Err(Error::TooLong {
                    element: "domain name",
                    max: MAX_NAME_LEN,
                });
            }

            if label_len == 0 {
                return Ok(Self { labels });
            }

            if label_len > MAX_LABEL_LEN {
                return Err(Error::BadLabel);
            }

            let raw = bytes.slice(label_len).map_err(|_| Error::Unterminated)?;
            if !raw.iter().all(|b| b.is_ascii_alphanumeric()) {
                return Err(Error::BadLabel);
            }

            // Only ASCII reaches this point
            labels.push(String::from_utf8(raw.to_vec()).map_err(|_| Error::BadLabel)?);
        }
    }

    /// Parse names back to back until the buffer is exhausted.
    pub fn parse_list(bytes: &mut BytesIn<'_>) -> Result<Vec<Self>, Error> {
        let mut names = Vec::new();
        while !bytes.is_empty() {
            names.push(Self::parse(bytes)?);
        }

        Ok(names)
    }

    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        for label in &self.labels {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(Error::BadLabel);
            }
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);

        Ok(())
    }

    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }
}

impl FromStr for DomainName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept a trailing dot for absolute names
        let s = s.strip_suffix('.').unwrap_or(s);

        let mut labels = Vec::new();
        let mut wire_len = 1;
        for label in s.split('.') {
            if label.is_empty()
                || label.len() > MAX_LABEL_LEN
                || !label.bytes().all(|b| b.is_ascii_alphanumeric())
            {
                return Err(Error::BadLabel);
            }

            wire_len += label.len() + 1;
            labels.push(label.to_string());
        }

        if wire_len > MAX_NAME_LEN {
            return Err(Error::TooLong {
                element: "domain name",
                max: MAX_NAME_LEN,
            });
        }

        Ok(Self { labels })
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for label in &self.labels {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", label)?;
            first = false;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_one(data: &[u8]) -> Result<DomainName, Error> {
        let mut bytes = BytesIn::new(data);
        DomainName::parse(&mut bytes)
    }

    #[test]
    fn simple_name() {
        let name = parse_one(b"\x03ns1\x07example\x03com\x00").unwrap();
        assert_eq!(name.to_string(), "ns1.example.com");

        let mut buf = Vec::new();
        name.write(&mut buf).unwrap();
        assert_eq!(buf, b"\x03ns1\x07example\x03com\x00");
    }

    #[test]
    fn missing_terminator() {
        assert_eq!(parse_one(b"\x03ns1"), Err(Error::Unterminated));
        assert_eq!(parse_one(b"\x03ns1\x07exam"), Err(Error::Unterminated));
    }

    #[test]
    fn label_too_long() {
        let mut data = vec![64u8];
        data.extend_from_slice(&[b'a'; 64]);
        data.push(0);
        assert_eq!(parse_one(&data), Err(Error::BadLabel));
    }

    #[test]
    fn non_alphanumeric_label() {
        assert_eq!(parse_one(b"\x04ns-1\x00"), Err(Error::BadLabel));
        assert_eq!(parse_one(b"\x03n_1\x00"), Err(Error::BadLabel));
    }

    #[test]
    fn name_list() {
        let mut bytes = BytesIn::new(b"\x03one\x00\x03two\x00");
        let names = DomainName::parse_list(&mut bytes).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1].to_string(), "two");
    }

    #[test]
    fn from_str_round_trip() {
        let name: DomainName = "time.example.org.".parse().unwrap();
        assert_eq!(name.to_string(), "time.example.org");
        assert!("bad-label.example.org".parse::<DomainName>().is_err());
        assert!("".parse::<DomainName>().is_err());
    }

    #[test]
    fn total_length_capped() {
        // 5 x 50-byte labels exceed the 255 octet limit
        let mut data = Vec::new();
        for _ in 0..5 {
            data.push(50u8);
            data.extend_from_slice(&[b'x'; 50]);
        }
        data.push(0);
        assert!(matches!(parse_one(&data), Err(Error::TooLong { .. })));
    }
}
