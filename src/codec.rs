//! Payload conversions between the three forms a value takes: hexadecimal
//! text at the API surface, raw bytes in memory, and base64 text on the wire.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use uuid::Uuid;

use crate::{Error, Result};

/// Suffix of the Bluetooth base UUID, used to expand 16 and 32 bit ids.
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

pub fn hex_to_bytes(value: &str) -> Result<Vec<u8>> {
  Ok(hex::decode(value.trim())?)
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
  hex::encode(bytes)
}

pub fn bytes_to_base64(bytes: &[u8]) -> String {
  BASE64_STANDARD.encode(bytes)
}

pub fn base64_to_bytes(value: &str) -> Result<Vec<u8>> {
  Ok(BASE64_STANDARD.decode(value)?)
}

/// Caller hex → wire base64.
pub fn hex_to_base64(value: &str) -> Result<String> {
  Ok(bytes_to_base64(&hex_to_bytes(value)?))
}

/// Wire base64 → caller hex (lowercase).
pub fn base64_to_hex(value: &str) -> Result<String> {
  Ok(bytes_to_hex(&base64_to_bytes(value)?))
}

pub fn text_to_base64(text: &str) -> String {
  bytes_to_base64(text.as_bytes())
}

/// Accepts a full UUID or a 16/32-bit short form (`180f`, `0x2a19`).
pub fn parse_uuid(input: &str) -> Result<Uuid> {
  let trimmed = input.trim().trim_start_matches("0x");
  let normalized = match trimmed.len() {
    4 => format!("0000{trimmed}{BASE_UUID_SUFFIX}"),
    8 => format!("{trimmed}{BASE_UUID_SUFFIX}"),
    _ => trimmed.to_string(),
  };
  Ok(Uuid::parse_str(&normalized)?)
}

/// Interprets a characteristic value as one big-endian integer and renders
/// it as a `#rrggbb` color. Values wider than 24 bits keep all their digits.
pub fn hex_to_color(value: &str) -> Result<String> {
  let digits = significant_hex_digits(value)?;
  Ok(format!("#{digits:0>6}"))
}

/// Inverse of [`hex_to_color`]: `#0000ff` → `ff`, `#123456` → `123456`.
/// The result always has an even number of digits so it decodes to whole
/// bytes.
pub fn color_to_hex(color: &str) -> Result<String> {
  let digits = significant_hex_digits(color.trim().trim_start_matches('#'))?;
  if digits.len() % 2 == 1 {
    Ok(format!("0{digits}"))
  } else {
    Ok(digits)
  }
}

/// Lowercase digits of a hex integer without leading zeros (`"0"` for zero).
/// Works on the text, so there is no width limit.
fn significant_hex_digits(value: &str) -> Result<String> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return Err(Error::InvalidRequest("empty hex value".into()));
  }
  if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(Error::InvalidRequest(format!("invalid hex value '{trimmed}'")));
  }
  let significant = trimmed.trim_start_matches('0');
  if significant.is_empty() {
    return Ok("0".to_string());
  }
  Ok(significant.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ErrorKind;

  #[test]
  fn hex_base64_round_trip_keeps_edge_bytes() {
    let wire = hex_to_base64("00ff00ff").unwrap();
    assert_eq!(wire, "AP8A/w==");
    assert_eq!(base64_to_hex(&wire).unwrap(), "00ff00ff");
  }

  #[test]
  fn round_trip_over_every_byte_value() {
    let all: Vec<u8> = (0..=255).collect();
    let hex = bytes_to_hex(&all);
    assert_eq!(base64_to_hex(&hex_to_base64(&hex).unwrap()).unwrap(), hex);
  }

  #[test]
  fn uppercase_hex_is_accepted_and_normalized() {
    let wire = hex_to_base64("DEADBEEF").unwrap();
    assert_eq!(base64_to_hex(&wire).unwrap(), "deadbeef");
  }

  #[test]
  fn odd_length_hex_is_rejected() {
    let err = hex_to_base64("abc").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
  }

  #[test]
  fn empty_payload_round_trips_to_empty() {
    assert_eq!(hex_to_base64("").unwrap(), "");
    assert_eq!(base64_to_hex("").unwrap(), "");
  }

  #[test]
  fn short_uuids_expand_to_base_uuid() {
    let battery = parse_uuid("180f").unwrap();
    assert_eq!(battery.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
    let level = parse_uuid("0x2A19").unwrap();
    assert_eq!(level.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");
    assert!(parse_uuid("SERVICE_UUID").is_err());
  }

  #[test]
  fn colors_pad_like_the_ui_expects() {
    assert_eq!(hex_to_color("64").unwrap(), "#000064");
    assert_eq!(hex_to_color("ff8800").unwrap(), "#ff8800");
    assert_eq!(color_to_hex("#0000ff").unwrap(), "ff");
    assert_eq!(color_to_hex("#000000").unwrap(), "00");
    assert_eq!(color_to_hex("#00abc").unwrap(), "0abc");
    assert_eq!(color_to_hex("#123456").unwrap(), "123456");
    assert!(color_to_hex("#zzzzzz").is_err());
  }

  #[test]
  fn wide_values_keep_every_digit() {
    let nine_bytes = "0102030405060708ff";
    assert_eq!(hex_to_color(nine_bytes).unwrap(), "#102030405060708ff");
    assert_eq!(hex_to_color("0000000000000000000064").unwrap(), "#000064");
    assert_eq!(hex_to_color("00").unwrap(), "#000000");
    assert_eq!(color_to_hex("#102030405060708ff").unwrap(), "0102030405060708ff");
  }
}
