//! DLMS tagged data values (A-XDR encoding, Green Book Ed. 12, Section 4.1.6).
//!
//! Only the tags a COSEM register's attributes 2 and 3 can hold are
//! supported; anything else surfaces as [`DataError::UnsupportedDataType`].

use std::fmt;

const TAG_NULL: u8 = 0x00;
const TAG_STRUCTURE: u8 = 0x02;
const TAG_DOUBLE_LONG: u8 = 0x05;
const TAG_DOUBLE_LONG_UNSIGNED: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x09;
const TAG_VISIBLE_STRING: u8 = 0x0A;
const TAG_INTEGER: u8 = 0x0F;
const TAG_LONG: u8 = 0x10;
const TAG_UNSIGNED: u8 = 0x11;
const TAG_LONG_UNSIGNED: u8 = 0x12;
const TAG_LONG64_UNSIGNED: u8 = 0x14;
const TAG_ENUM: u8 = 0x16;

#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Data {
    Null,
    Structure(Vec<Data>),
    DoubleLong(i32),
    DoubleLongUnsigned(u32),
    OctetString(Vec<u8>),
    VisibleString(String),
    Integer(i8),
    Long(i16),
    Unsigned(u8),
    LongUnsigned(u16),
    Long64Unsigned(u64),
    Enum(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// Fewer bytes remained than the tag's fixed or declared length required.
    Truncated,
    /// A tag outside the set this bridge understands.
    UnsupportedDataType(u8),
    /// A value was present but not of the shape the caller expected (e.g. a
    /// scaler/unit structure whose elements aren't `Integer`/`Enum`).
    UnexpectedType,
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::Truncated => write!(f, "truncated DLMS data value"),
            DataError::UnsupportedDataType(tag) => write!(f, "unsupported DLMS data type tag 0x{tag:02X}"),
            DataError::UnexpectedType => write!(f, "DLMS data value was not of the expected shape"),
        }
    }
}

impl std::error::Error for DataError {}

fn take<'a>(input: &'a [u8], n: usize) -> Result<(&'a [u8], &'a [u8]), DataError> {
    if input.len() < n {
        return Err(DataError::Truncated);
    }
    Ok((&input[..n], &input[n..]))
}

impl Data {
    /// Decodes one tagged value from the front of `input`, returning the value
    /// and the number of bytes consumed.
    pub fn decode(input: &[u8]) -> Result<(Self, usize), DataError> {
        let (&tag, rest) = input.split_first().ok_or(DataError::Truncated)?;
        let start_len = input.len();

        let (value, rest) = match tag {
            TAG_NULL => (Data::Null, rest),
            TAG_STRUCTURE => {
                let (&count, mut rest) = rest.split_first().ok_or(DataError::Truncated)?;
                let mut elements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (element, consumed) = Data::decode(rest)?;
                    elements.push(element);
                    rest = &rest[consumed..];
                }
                (Data::Structure(elements), rest)
            }
            TAG_DOUBLE_LONG => {
                let (bytes, rest) = take(rest, 4)?;
                (Data::DoubleLong(i32::from_be_bytes(bytes.try_into().unwrap())), rest)
            }
            TAG_DOUBLE_LONG_UNSIGNED => {
                let (bytes, rest) = take(rest, 4)?;
                (Data::DoubleLongUnsigned(u32::from_be_bytes(bytes.try_into().unwrap())), rest)
            }
            TAG_OCTET_STRING => {
                let (&len, rest) = rest.split_first().ok_or(DataError::Truncated)?;
                let (bytes, rest) = take(rest, len as usize)?;
                (Data::OctetString(bytes.to_vec()), rest)
            }
            TAG_VISIBLE_STRING => {
                let (&len, rest) = rest.split_first().ok_or(DataError::Truncated)?;
                let (bytes, rest) = take(rest, len as usize)?;
                let s = bytes.iter().map(|&b| b as char).collect();
                (Data::VisibleString(s), rest)
            }
            TAG_INTEGER => {
                let (&b, rest) = rest.split_first().ok_or(DataError::Truncated)?;
                (Data::Integer(b as i8), rest)
            }
            TAG_LONG => {
                let (bytes, rest) = take(rest, 2)?;
                (Data::Long(i16::from_be_bytes(bytes.try_into().unwrap())), rest)
            }
            TAG_UNSIGNED => {
                let (&b, rest) = rest.split_first().ok_or(DataError::Truncated)?;
                (Data::Unsigned(b), rest)
            }
            TAG_LONG_UNSIGNED => {
                let (bytes, rest) = take(rest, 2)?;
                (Data::LongUnsigned(u16::from_be_bytes(bytes.try_into().unwrap())), rest)
            }
            TAG_LONG64_UNSIGNED => {
                let (bytes, rest) = take(rest, 8)?;
                (Data::Long64Unsigned(u64::from_be_bytes(bytes.try_into().unwrap())), rest)
            }
            TAG_ENUM => {
                let (&b, rest) = rest.split_first().ok_or(DataError::Truncated)?;
                (Data::Enum(b), rest)
            }
            other => return Err(DataError::UnsupportedDataType(other)),
        };

        let consumed = start_len - rest.len();
        Ok((value, consumed))
    }

    /// Encodes the value to A-XDR format (tag followed by its payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            Data::Null => buffer.push(TAG_NULL),
            Data::Structure(elements) => {
                buffer.push(TAG_STRUCTURE);
                buffer.push(elements.len() as u8);
                for element in elements {
                    buffer.extend(element.encode());
                }
            }
            Data::DoubleLong(v) => {
                buffer.push(TAG_DOUBLE_LONG);
                buffer.extend(v.to_be_bytes());
            }
            Data::DoubleLongUnsigned(v) => {
                buffer.push(TAG_DOUBLE_LONG_UNSIGNED);
                buffer.extend(v.to_be_bytes());
            }
            Data::OctetString(bytes) => {
                buffer.push(TAG_OCTET_STRING);
                buffer.push(bytes.len() as u8);
                buffer.extend(bytes);
            }
            Data::VisibleString(s) => {
                buffer.push(TAG_VISIBLE_STRING);
                buffer.push(s.len() as u8);
                buffer.extend(s.bytes());
            }
            Data::Integer(v) => {
                buffer.push(TAG_INTEGER);
                buffer.push(*v as u8);
            }
            Data::Long(v) => {
                buffer.push(TAG_LONG);
                buffer.extend(v.to_be_bytes());
            }
            Data::Unsigned(v) => {
                buffer.push(TAG_UNSIGNED);
                buffer.push(*v);
            }
            Data::LongUnsigned(v) => {
                buffer.push(TAG_LONG_UNSIGNED);
                buffer.extend(v.to_be_bytes());
            }
            Data::Long64Unsigned(v) => {
                buffer.push(TAG_LONG64_UNSIGNED);
                buffer.extend(v.to_be_bytes());
            }
            Data::Enum(v) => {
                buffer.push(TAG_ENUM);
                buffer.push(*v);
            }
        }
        buffer
    }

    /// Interprets the value as a signed integer, covering every numeric tag a
    /// register's value attribute can carry.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Data::DoubleLong(v) => Some(*v as i64),
            Data::DoubleLongUnsigned(v) => Some(*v as i64),
            Data::Integer(v) => Some(*v as i64),
            Data::Long(v) => Some(*v as i64),
            Data::Unsigned(v) => Some(*v as i64),
            Data::LongUnsigned(v) => Some(*v as i64),
            Data::Long64Unsigned(v) => Some(*v as i64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_null() {
        let (data, consumed) = Data::decode(&[0x00]).unwrap();
        assert_eq!(data, Data::Null);
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_roundtrip_double_long() {
        let data = Data::DoubleLong(-12345);
        let encoded = data.encode();
        let (decoded, consumed) = Data::decode(&encoded).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_roundtrip_double_long_unsigned() {
        let data = Data::DoubleLongUnsigned(123_456_789);
        let encoded = data.encode();
        assert_eq!(Data::decode(&encoded).unwrap().0, data);
    }

    #[test]
    fn test_roundtrip_octet_string() {
        let data = Data::OctetString(vec![0xAA, 0xBB, 0xCC, 0xDD]);
        let encoded = data.encode();
        assert_eq!(encoded, [0x09, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(Data::decode(&encoded).unwrap().0, data);
    }

    #[test]
    fn test_roundtrip_visible_string() {
        let data = Data::VisibleString("123456789012".to_string());
        let encoded = data.encode();
        assert_eq!(Data::decode(&encoded).unwrap().0, data);
    }

    #[test]
    fn test_roundtrip_integer() {
        let data = Data::Integer(-2);
        assert_eq!(data.encode(), [0x0F, 0xFE]);
        assert_eq!(Data::decode(&data.encode()).unwrap().0, data);
    }

    #[test]
    fn test_roundtrip_long_unsigned() {
        let data = Data::LongUnsigned(1000);
        assert_eq!(Data::decode(&data.encode()).unwrap().0, data);
    }

    #[test]
    fn test_roundtrip_long64_unsigned() {
        let data = Data::Long64Unsigned(9_876_543_210);
        assert_eq!(Data::decode(&data.encode()).unwrap().0, data);
    }

    #[test]
    fn test_roundtrip_nested_structure() {
        let data = Data::Structure(vec![Data::Integer(-2), Data::Enum(30)]);
        let encoded = data.encode();
        assert_eq!(encoded, [0x02, 0x02, 0x0F, 0xFE, 0x16, 0x1E]);
        assert_eq!(Data::decode(&encoded).unwrap().0, data);
    }

    #[test]
    fn test_decode_stops_at_first_value_leaving_remainder() {
        let mut bytes = Data::DoubleLongUnsigned(42).encode();
        bytes.extend([0xFF, 0xFF]);
        let (data, consumed) = Data::decode(&bytes).unwrap();
        assert_eq!(data, Data::DoubleLongUnsigned(42));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_decode_truncated_fixed_width() {
        assert_eq!(Data::decode(&[TAG_DOUBLE_LONG, 0x00, 0x00]), Err(DataError::Truncated));
    }

    #[test]
    fn test_decode_truncated_length_prefixed() {
        assert_eq!(Data::decode(&[TAG_OCTET_STRING, 0x04, 0xAA]), Err(DataError::Truncated));
    }

    #[test]
    fn test_decode_unsupported_tag() {
        assert_eq!(Data::decode(&[0x17, 0x00]), Err(DataError::UnsupportedDataType(0x17)));
    }

    #[test]
    fn test_as_i64_covers_all_numeric_tags() {
        assert_eq!(Data::DoubleLong(-1).as_i64(), Some(-1));
        assert_eq!(Data::DoubleLongUnsigned(1).as_i64(), Some(1));
        assert_eq!(Data::Integer(-1).as_i64(), Some(-1));
        assert_eq!(Data::Long(-1).as_i64(), Some(-1));
        assert_eq!(Data::Unsigned(1).as_i64(), Some(1));
        assert_eq!(Data::LongUnsigned(1).as_i64(), Some(1));
        assert_eq!(Data::Long64Unsigned(1).as_i64(), Some(1));
        assert_eq!(Data::Null.as_i64(), None);
    }

    #[test]
    fn test_empty_structure_round_trips() {
        let data = Data::Structure(vec![]);
        assert_eq!(Data::decode(&data.encode()).unwrap().0, data);
    }
}
