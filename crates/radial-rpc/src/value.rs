//! Numeric coercion for wire integers.
//!
//! MessagePack encoders emit the most compact integer form, so a field that is
//! semantically a `u32` may arrive as any signed or unsigned width. Every
//! consumer of a wire integer goes through these helpers instead of matching
//! on widths at the call site.

use rmpv::Value;

/// Widen any wire integer to `i64`. Unsigned values above `i64::MAX` are
/// rejected.
pub fn to_int(value: &Value) -> Option<i64> {
    value.as_i64()
}

/// Widen any wire integer to `u64`, rejecting negative values.
pub fn to_uint(value: &Value) -> Option<u64> {
    value.as_u64()
}

/// Widen any wire integer to `u32`, rejecting negative and out-of-range
/// values. Message ids use this form.
pub fn to_u32(value: &Value) -> Option<u32> {
    to_uint(value).and_then(|v| u32::try_from(v).ok())
}

/// Human-readable name of a value's type, for diagnostics.
pub fn kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "bool",
        Value::Integer(_) => "integer",
        Value::F32(_) => "f32",
        Value::F64(_) => "f64",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "ext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widens_all_unsigned_widths() {
        for v in [0u64, u8::MAX as u64, u16::MAX as u64, u32::MAX as u64, u64::MAX] {
            assert_eq!(to_uint(&Value::from(v)), Some(v));
        }
    }

    #[test]
    fn widens_all_signed_widths() {
        for v in [0i64, i8::MIN as i64, i16::MIN as i64, i32::MIN as i64, i64::MIN] {
            assert_eq!(to_int(&Value::from(v)), Some(v));
        }
    }

    #[test]
    fn unsigned_rejects_negative() {
        assert_eq!(to_uint(&Value::from(-1)), None);
        assert_eq!(to_u32(&Value::from(-1)), None);
    }

    #[test]
    fn u32_rejects_out_of_range() {
        assert_eq!(to_u32(&Value::from(u32::MAX)), Some(u32::MAX));
        assert_eq!(to_u32(&Value::from(u32::MAX as u64 + 1)), None);
    }

    #[test]
    fn int_rejects_huge_unsigned() {
        assert_eq!(to_int(&Value::from(u64::MAX)), None);
        assert_eq!(to_int(&Value::from(i64::MAX as u64)), Some(i64::MAX));
    }

    #[test]
    fn non_integers_rejected() {
        for v in [Value::Nil, Value::from("1"), Value::from(1.0), Value::Boolean(true)] {
            assert_eq!(to_int(&v), None);
            assert_eq!(to_uint(&v), None);
        }
    }
}
