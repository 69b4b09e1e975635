//! OBIS code addressing (six-field object identifiers naming a meter quantity).

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An OBIS code, canonically written `A-B:C.D.E*F` with `F` defaulting to 255
/// when omitted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObisCode {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub f: u8,
}

impl ObisCode {
    pub fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// Encodes the OBIS code as 6 raw bytes (A-B-C-D-E-F), the wire form used
    /// inside a GET-Request's logical name field.
    pub fn encode(&self) -> [u8; 6] {
        [self.a, self.b, self.c, self.d, self.e, self.f]
    }

    pub fn decode(bytes: [u8; 6]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseObisCodeError(String);

impl Display for ParseObisCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid OBIS code {:?}: expected A-B:C.D.E[*F]", self.0)
    }
}

impl std::error::Error for ParseObisCodeError {}

impl FromStr for ObisCode {
    type Err = ParseObisCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseObisCodeError(s.to_string());

        let (ab, rest) = s.split_once(':').ok_or_else(err)?;
        let (a, b) = ab.split_once('-').ok_or_else(err)?;

        let (cde, f) = match rest.split_once('*') {
            Some((cde, f)) => (cde, Some(f)),
            None => (rest, None),
        };
        let mut cde_parts = cde.split('.');
        let c = cde_parts.next().ok_or_else(err)?;
        let d = cde_parts.next().ok_or_else(err)?;
        let e = cde_parts.next().ok_or_else(err)?;
        if cde_parts.next().is_some() {
            return Err(err());
        }

        let parse_field = |s: &str| s.parse::<u8>().map_err(|_| err());
        Ok(ObisCode::new(
            parse_field(a)?,
            parse_field(b)?,
            parse_field(c)?,
            parse_field(d)?,
            parse_field(e)?,
            f.map(parse_field).transpose()?.unwrap_or(255),
        ))
    }
}

impl TryFrom<String> for ObisCode {
    type Error = ParseObisCodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ObisCode> for String {
    fn from(code: ObisCode) -> Self {
        code.to_string()
    }
}

impl Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.f == 255 {
            write!(f, "{}-{}:{}.{}.{}", self.a, self.b, self.c, self.d, self.e)
        } else {
            write!(f, "{}-{}:{}.{}.{}*{}", self.a, self.b, self.c, self.d, self.e, self.f)
        }
    }
}

impl Debug for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObisCode({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_basic() {
        let code = ObisCode::new(1, 1, 32, 7, 0, 255);
        assert_eq!(code.encode(), [1, 1, 32, 7, 0, 255]);
    }

    #[test]
    fn test_decode_round_trips_encode() {
        let code = ObisCode::new(1, 1, 1, 8, 0, 255);
        assert_eq!(ObisCode::decode(code.encode()), code);
    }

    #[test]
    fn test_display_omits_default_f() {
        let code = ObisCode::new(1, 1, 32, 7, 0, 255);
        assert_eq!(code.to_string(), "1-1:32.7.0");
    }

    #[test]
    fn test_display_includes_explicit_f() {
        let code = ObisCode::new(1, 1, 32, 7, 0, 1);
        assert_eq!(code.to_string(), "1-1:32.7.0*1");
    }

    #[test]
    fn test_from_str_without_f_defaults_to_255() {
        let code: ObisCode = "1-1:32.7.0".parse().unwrap();
        assert_eq!(code, ObisCode::new(1, 1, 32, 7, 0, 255));
    }

    #[test]
    fn test_from_str_with_explicit_f() {
        let code: ObisCode = "1-1:1.8.0*1".parse().unwrap();
        assert_eq!(code, ObisCode::new(1, 1, 1, 8, 0, 1));
    }

    #[test]
    fn test_round_trip_string_default_f() {
        let original = "1-1:14.7.0";
        let code: ObisCode = original.parse().unwrap();
        assert_eq!(code.to_string(), original);
    }

    #[test]
    fn test_round_trip_string_explicit_f() {
        let original = "1-1:52.7.0*3";
        let code: ObisCode = original.parse().unwrap();
        assert_eq!(code.to_string(), original);
    }

    #[test]
    fn test_from_str_rejects_missing_colon() {
        assert!("1-1 32.7.0".parse::<ObisCode>().is_err());
    }

    #[test]
    fn test_from_str_rejects_missing_dash() {
        assert!("1:32.7.0".parse::<ObisCode>().is_err());
    }

    #[test]
    fn test_from_str_rejects_too_few_fields() {
        assert!("1-1:32.7".parse::<ObisCode>().is_err());
    }

    #[test]
    fn test_from_str_rejects_out_of_range_field() {
        assert!("1-1:32.7.999".parse::<ObisCode>().is_err());
    }

    #[test]
    fn test_measurement_table_obis_codes_parse() {
        let codes = [
            "1-1:32.7.0",
            "1-1:31.7.0",
            "1-1:14.7.0",
            "1-1:1.7.0",
            "1-1:1.8.0",
            "1-1:52.7.0",
            "1-1:72.7.0",
            "1-1:51.7.0",
            "1-1:71.7.0",
        ];
        for code in codes {
            assert!(code.parse::<ObisCode>().is_ok(), "{code} should parse");
        }
    }
}
