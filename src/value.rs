//! State values: the typed payload carried by every interval.

use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest string value that can be stored, in bytes.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Type tag of a state value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Null,
    Int,
    Long,
    Double,
    String,
}

impl ValueType {
    /// Stable one-byte tag used in the binary encoding.
    pub fn tag(self) -> u8 {
        match self {
            ValueType::Null => 0,
            ValueType::Int => 1,
            ValueType::Long => 2,
            ValueType::Double => 3,
            ValueType::String => 4,
        }
    }

    /// Parse a one-byte tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(ValueType::Null),
            1 => Ok(ValueType::Int),
            2 => Ok(ValueType::Long),
            3 => Ok(ValueType::Double),
            4 => Ok(ValueType::String),
            other => Err(StateError::InvalidFormat(format!(
                "Unknown state value tag: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Null => "null",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::String => "string",
        };
        f.write_str(name)
    }
}

/// Value held by an attribute over an interval.
///
/// `Null` means the attribute had no defined value in that interval, which is
/// different from the attribute not existing at all.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl StateValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            StateValue::Null => ValueType::Null,
            StateValue::Int(_) => ValueType::Int,
            StateValue::Long(_) => ValueType::Long,
            StateValue::Double(_) => ValueType::Double,
            StateValue::String(_) => ValueType::String,
        }
    }

    pub fn type_tag(&self) -> u8 {
        self.value_type().tag()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Encode the payload (without the type tag).
    ///
    /// Numbers are little-endian; strings are their UTF-8 bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            StateValue::Null => Vec::new(),
            StateValue::Int(v) => v.to_le_bytes().to_vec(),
            StateValue::Long(v) => v.to_le_bytes().to_vec(),
            StateValue::Double(v) => v.to_le_bytes().to_vec(),
            StateValue::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Decode a payload produced by [`StateValue::encode`].
    pub fn decode(bytes: &[u8], type_tag: u8) -> Result<Self> {
        let value_type = ValueType::from_tag(type_tag)?;
        let expect_len = |len: usize| -> Result<()> {
            if bytes.len() != len {
                return Err(StateError::Deserialization(format!(
                    "{} payload must be {} bytes, got {}",
                    value_type,
                    len,
                    bytes.len()
                )));
            }
            Ok(())
        };

        match value_type {
            ValueType::Null => {
                expect_len(0)?;
                Ok(StateValue::Null)
            }
            ValueType::Int => {
                expect_len(4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                Ok(StateValue::Int(i32::from_le_bytes(buf)))
            }
            ValueType::Long => {
                expect_len(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(StateValue::Long(i64::from_le_bytes(buf)))
            }
            ValueType::Double => {
                expect_len(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(StateValue::Double(f64::from_le_bytes(buf)))
            }
            ValueType::String => {
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| StateError::Deserialization(e.to_string()))?;
                Ok(StateValue::String(s.to_string()))
            }
        }
    }

    /// Size of the encoded payload in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            StateValue::Null => 0,
            StateValue::Int(_) => 4,
            StateValue::Long(_) | StateValue::Double(_) => 8,
            StateValue::String(s) => s.len(),
        }
    }

    pub fn unbox_int(&self) -> Result<i32> {
        match self {
            StateValue::Int(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Int)),
        }
    }

    pub fn unbox_long(&self) -> Result<i64> {
        match self {
            StateValue::Long(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Long)),
        }
    }

    pub fn unbox_double(&self) -> Result<f64> {
        match self {
            StateValue::Double(v) => Ok(*v),
            other => Err(other.mismatch(ValueType::Double)),
        }
    }

    pub fn unbox_str(&self) -> Result<&str> {
        match self {
            StateValue::String(s) => Ok(s),
            other => Err(other.mismatch(ValueType::String)),
        }
    }

    fn mismatch(&self, expected: ValueType) -> StateError {
        StateError::StateValueType {
            expected,
            actual: self.value_type(),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => f.write_str("null"),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Long(v) => write!(f, "{}", v),
            StateValue::Double(v) => write!(f, "{}", v),
            StateValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}
