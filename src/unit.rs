//! COSEM physical units (Green Book Ed. 12, Section 4.1.6.1 enum table) and
//! the scaler/unit pair attached to register attribute 3.

use std::fmt;

use derive_try_from_primitive::TryFromPrimitive;
use serde::Serialize;

use crate::data::{Data, DataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum Unit {
  Year                       =   1,
  Month                      =   2,
  Week                       =   3,
  Day                        =   4,
  Hour                       =   5,
  Minute                     =   6,
  Second                     =   7,
  Degree                     =   8,
  DegreeCelsius              =   9,
  Currency                   =  10,
  Meter                      =  11,
  MeterPerSecond             =  12,
  CubicMeter                 =  13,
  CubicMeterCorrected        =  14,
  CubicMeterPerHour          =  15,
  CubicMeterPerHourCorrected =  16,
  CubicMeterPerDay           =  17,
  CubicMeterPerDayCorrected  =  18,
  Liter                      =  19,
  Kilogramm                  =  20,
  Newton                     =  21,
  Newtonmeter                =  22,
  Pascal                     =  23,
  Bar                        =  24,
  Joule                      =  25,
  JoulePerHour               =  26,
  Watt                       =  27,
  VoltAmpere                 =  28,
  Var                        =  29,
  WattHour                   =  30,
  VoltAmpereHour             =  31,
  VarHour                    =  32,
  Ampere                     =  33,
  Coulomb                    =  34,
  Volt                       =  35,
  VoltPerMeter               =  36,
  Farad                      =  37,
  Ohm                        =  38,
  OhmMeter                   =  39,
  Weber                      =  40,
  Tesla                      =  41,
  AmperePerMeter             =  42,
  Henry                      =  43,
  Hertz                      =  44,
  InverseWattHour            =  45,
  InverseVarHour             =  46,
  InverseVoltAmpereHour      =  47,
  VoltSquaredHour            =  48,
  AmpereSquaredHour          =  49,
  KilogrammPerSecond         =  50,
  Siemens                    =  51,
  Kelvin                     =  52,
  InverseVoltSquaredHour     =  53,
  InverseAmpereSquaredHour   =  54,
  InverseCubicMeter          =  55,
  Percent                    =  56,
  AmpereHour                 =  57,
  // 58-59 reserved
  WattHourPerCubicMeter      =  60,
  JoulePerCubicMeter         =  61,
  MolePercent                =  62,
  GrammPerCubicMeter         =  63,
  PascalSecond               =  64,
  JoulePerKilogramm          =  65,
  GramPerSquareCentimeter    =  66,
  Atmosphere                 =  67,
  // 68-69 reserved
  DezibelMilliwatt           =  70,
  DezibelMicrovolt           =  71,
  Dezibel                    =  72,
  // 73-127 reserved, 128-174 non-SI, 175-252 reserved, 253 extended table
  Other                      = 254,
  Count                      = 255,
}

impl Unit {
    pub fn encode(&self) -> u8 {
        *self as u8
    }

    /// Signed encoding used inside the scaler/unit `Structure(Integer, Enum)`.
    pub fn as_i8(&self) -> i8 {
        *self as u8 as i8
    }

    #[rustfmt::skip]
    pub fn as_str(&self) -> Option<&'static str> {
    Some(match self {
      Self::Year                       => "a",
      Self::Month                      => "mo",
      Self::Week                       => "wk",
      Self::Day                        => "d",
      Self::Hour                       => "h",
      Self::Minute                     => "min",
      Self::Second                     => "s",
      Self::Degree                     => "°",
      Self::DegreeCelsius              => "°C",
      Self::Currency                   => "currency",
      Self::Meter                      => "m",
      Self::MeterPerSecond             => "m/s",
      Self::CubicMeter                 => "m³",
      Self::CubicMeterCorrected        => "m³",
      Self::CubicMeterPerHour          => "m³/h",
      Self::CubicMeterPerHourCorrected => "m³/h",
      Self::CubicMeterPerDay           => "m³/d",
      Self::CubicMeterPerDayCorrected  => "m³/d",
      Self::Liter                      => "l",
      Self::Kilogramm                  => "kg",
      Self::Newton                     => "N",
      Self::Newtonmeter                => "Nm",
      Self::Pascal                     => "Pa",
      Self::Bar                        => "bar",
      Self::Joule                      => "J",
      Self::JoulePerHour               => "J/h",
      Self::Watt                       => "W",
      Self::VoltAmpere                 => "VA",
      Self::Var                        => "var",
      Self::WattHour                   => "Wh",
      Self::VoltAmpereHour             => "VAh",
      Self::VarHour                    => "varh",
      Self::Ampere                     => "A",
      Self::Coulomb                    => "C",
      Self::Volt                       => "V",
      Self::VoltPerMeter               => "V/m",
      Self::Farad                      => "F",
      Self::Ohm                        => "Ω",
      Self::OhmMeter                   => "Ωm",
      Self::Weber                      => "Wb",
      Self::Tesla                      => "T",
      Self::AmperePerMeter             => "A/m",
      Self::Henry                      => "H",
      Self::Hertz                      => "Hz",
      Self::InverseWattHour            => "1/(Wh)",
      Self::InverseVarHour             => "1/(varh)",
      Self::InverseVoltAmpereHour      => "1/(VAh)",
      Self::VoltSquaredHour            => "V²h",
      Self::AmpereSquaredHour          => "A²h",
      Self::KilogrammPerSecond         => "kg/s",
      Self::Siemens                    => "S",
      Self::Kelvin                     => "K",
      Self::InverseVoltSquaredHour     => "1/(V²h)",
      Self::InverseAmpereSquaredHour   => "1/(A²h)",
      Self::InverseCubicMeter          => "1/m³",
      Self::Percent                    => "%",
      Self::AmpereHour                 => "Ah",
      Self::WattHourPerCubicMeter      => "Wh/m³",
      Self::JoulePerCubicMeter         => "J/m³",
      Self::MolePercent                => "Mol %",
      Self::GrammPerCubicMeter         => "g/m³",
      Self::PascalSecond               => "Pa s",
      Self::JoulePerKilogramm          => "J/kg",
      Self::GramPerSquareCentimeter    => "g/cm²",
      Self::Atmosphere                 => "atm",
      Self::DezibelMilliwatt           => "dBm",
      Self::DezibelMicrovolt           => "dBµV",
      Self::Dezibel                    => "dB",
      Self::Other | Self::Count        => return None,
    })
  }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() { s.fmt(f) } else { Ok(()) }
    }
}

impl Serialize for Unit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if let Some(s) = self.as_str() {
            serializer.serialize_str(s)
        } else {
            serializer.serialize_none()
        }
    }
}

/// Scaler/unit pair held by a register's attribute 3: `scaled_value = raw * 10^scaler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalerUnit {
    pub scaler: i8,
    pub unit: Unit,
}

impl Default for ScalerUnit {
    fn default() -> Self {
        Self { scaler: 0, unit: Unit::Count }
    }
}

impl ScalerUnit {
    /// Encodes as A-XDR `Structure(Integer, Enum)`, e.g. scaler=-2, unit=Wh →
    /// `02 02 0F FE 16 1E`.
    pub fn encode(&self) -> Vec<u8> {
        Data::Structure(vec![Data::Integer(self.scaler), Data::Enum(self.unit.encode())]).encode()
    }

    /// Decodes a `Structure(Integer, Enum)`, returning the value and the
    /// number of bytes consumed from `input`.
    pub fn decode(input: &[u8]) -> Result<(Self, usize), DataError> {
        let (data, consumed) = Data::decode(input)?;
        Ok((Self::from_data(&data)?, consumed))
    }

    /// Converts an already-decoded attribute-3 value (a `Structure(Integer, Enum)`)
    /// into a scaler/unit pair.
    pub fn from_data(data: &Data) -> Result<Self, DataError> {
        match data {
            Data::Structure(elements) if elements.len() == 2 => {
                let scaler = match elements[0] {
                    Data::Integer(s) => s,
                    _ => return Err(DataError::UnexpectedType),
                };
                let unit_value = match elements[1] {
                    Data::Enum(u) => u,
                    _ => return Err(DataError::UnexpectedType),
                };
                let unit = Unit::try_from(unit_value).map_err(|_| DataError::UnexpectedType)?;
                Ok(ScalerUnit { scaler, unit })
            }
            _ => Err(DataError::UnexpectedType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_from_valid_units() {
        assert_eq!(Unit::try_from(1).unwrap(), Unit::Year);
        assert_eq!(Unit::try_from(30).unwrap(), Unit::WattHour);
        assert_eq!(Unit::try_from(33).unwrap(), Unit::Ampere);
        assert_eq!(Unit::try_from(35).unwrap(), Unit::Volt);
        assert_eq!(Unit::try_from(44).unwrap(), Unit::Hertz);
        assert_eq!(Unit::try_from(255).unwrap(), Unit::Count);
    }

    #[test]
    fn test_try_from_invalid_units() {
        assert!(Unit::try_from(0).is_err());
        assert!(Unit::try_from(58).is_err());
        assert!(Unit::try_from(253).is_err());
    }

    #[test]
    fn test_display_format() {
        assert_eq!(format!("{}", Unit::WattHour), "Wh");
        assert_eq!(format!("{}", Unit::Ampere), "A");
        assert_eq!(format!("{}", Unit::Volt), "V");
        assert_eq!(format!("{}", Unit::Hertz), "Hz");
        assert_eq!(format!("{}", Unit::Other), "");
    }

    #[test]
    fn test_scaler_unit_encode_basic() {
        let su = ScalerUnit { scaler: -2, unit: Unit::WattHour };
        let encoded = su.encode();
        assert_eq!(encoded, [0x02, 0x02, 0x0F, 0xFE, 0x16, 0x1E]);
    }

    #[test]
    fn test_scaler_unit_decode_basic() {
        let input = [0x02, 0x02, 0x0F, 0xFE, 0x16, 0x1E];
        let (su, consumed) = ScalerUnit::decode(&input).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(su.scaler, -2);
        assert_eq!(su.unit, Unit::WattHour);
    }

    #[test]
    fn test_scaler_unit_roundtrip() {
        let cases = [
            ScalerUnit { scaler: -2, unit: Unit::WattHour },
            ScalerUnit { scaler: 3, unit: Unit::Ampere },
            ScalerUnit { scaler: 0, unit: Unit::Volt },
            ScalerUnit { scaler: -1, unit: Unit::Hertz },
        ];
        for original in cases {
            let encoded = original.encode();
            let (decoded, consumed) = ScalerUnit::decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_scaler_unit_decode_invalid_unit_value() {
        let input = [0x02, 0x02, 0x0F, 0xFE, 0x16, 0x3A];
        assert!(ScalerUnit::decode(&input).is_err());
    }

    #[test]
    fn test_scaler_unit_decode_wrong_shape() {
        let input = [0x0F, 0x01];
        assert!(ScalerUnit::decode(&input).is_err());
    }
}
