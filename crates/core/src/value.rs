//! Tagged-Value Codec
//!
//! Encodes every runtime datum into a single 32-bit IEEE-754 quantity using
//! NaN-boxing. Finite, non-NaN float32 values represent themselves (tag
//! NUMBER). Everything else is a quiet NaN carrying a 6-bit tag in bits
//! 16-21 and a 16-bit payload in bits 0-15:
//!
//! ```text
//! Tagged:  0111_1111_11TT_TTTT_PPPP_PPPP_PPPP_PPPP
//!                      ^^^^^^-- 6-bit tag (bits 21:16)
//!                              ^^^^^^^^^^^^^^^^-- 16-bit payload (bits 15:0)
//! ```
//!
//! Tag 0 (NUMBER) is reserved to mean "not tagged, read as float" — it is
//! never produced by `encode`. A cell is tagged only if the exponent is all
//! ones, the quiet-NaN bit is set, *and* at least one of bits 0-21 is
//! nonzero; the all-zero case (`0x7FC0_0000`, a vanilla quiet NaN) is the
//! canonical "NaN produced by arithmetic" pattern and reads back as NUMBER.

use crate::error::CoreError;

// =============================================================================
// Constants
// =============================================================================

/// Base pattern for every tagged cell: exponent all-ones, quiet bit set.
const TAGGED_BASE: u32 = 0x7FC0_0000;

/// Mask covering the exponent + quiet-NaN bits (bits 22-30 inclusive of bit 30).
const QUIET_NAN_MASK: u32 = 0x7FC0_0000;

/// Mask for bits 0-21 (tag + payload): any of these nonzero means "tagged".
const TAG_AND_PAYLOAD_MASK: u32 = 0x003F_FFFF;

/// Shift to place a 6-bit tag into bits 16-21.
const TAG_SHIFT: u32 = 16;

/// Mask for the 6-bit tag once shifted into position.
const TAG_MASK: u32 = 0x003F_0000;

/// Mask for the 16-bit payload.
const PAYLOAD_MASK: u32 = 0x0000_FFFF;

/// The canonical NaN pattern produced when host arithmetic yields NaN.
/// Tag bits and payload are both zero, so this is never mistaken for a
/// tagged value.
pub const CANONICAL_NAN: u32 = 0x7FC0_0000;

/// Maximum representable INTEGER payload (signed 16-bit).
pub const MAX_INTEGER: i32 = i16::MAX as i32;

/// Minimum representable INTEGER payload (signed 16-bit).
pub const MIN_INTEGER: i32 = i16::MIN as i32;

// =============================================================================
// Tag
// =============================================================================

/// The 6-bit type discriminator carried by a tagged cell.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Sentinel only: values carrying this "tag" are untagged floats.
    Number = 0,
    /// Signed 16-bit integer; payload 0 is NIL.
    Integer = 1,
    /// Byte offset into the code segment (user-defined word reference).
    Code = 2,
    /// Identifier into the string digest.
    String = 3,
    /// List header; payload is the slot count.
    List = 4,
    /// Local-variable slot index, relative to the current frame base.
    Local = 5,
    /// Opcode (0-127) of a built-in operation.
    Builtin = 6,
    /// Reserved for future control signals.
    Sentinel = 7,
}

impl Tag {
    #[inline]
    pub fn from_u8(raw: u8) -> Tag {
        match raw & 0x3F {
            0 => Tag::Number,
            1 => Tag::Integer,
            2 => Tag::Code,
            3 => Tag::String,
            4 => Tag::List,
            5 => Tag::Local,
            6 => Tag::Builtin,
            _ => Tag::Sentinel,
        }
    }
}

// =============================================================================
// TaggedValue
// =============================================================================

/// A single 32-bit NaN-boxed cell: either an ordinary float32 or a tagged
/// (tag, payload) pair.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq)]
pub struct TaggedValue(u32);

/// The canonical absent-value cell: INTEGER tag, payload 0.
pub const NIL: TaggedValue = TaggedValue(TAGGED_BASE | (1 << TAG_SHIFT));

impl TaggedValue {
    // =========================================================================
    // Classification
    // =========================================================================

    /// True if this cell should be read as an ordinary float32 (tag NUMBER).
    #[inline(always)]
    pub fn is_number(self) -> bool {
        (self.0 & QUIET_NAN_MASK) != QUIET_NAN_MASK || (self.0 & TAG_AND_PAYLOAD_MASK) == 0
    }

    /// True if this cell carries an explicit tag (anything but NUMBER).
    #[inline(always)]
    pub fn is_tagged(self) -> bool {
        !self.is_number()
    }

    /// NIL is INTEGER-tagged with payload 0.
    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self == NIL
    }

    /// Boolean semantics: zero is false, anything else is true.
    #[inline(always)]
    pub fn is_truthy(self) -> bool {
        if self.is_number() {
            self.as_float() != 0.0
        } else {
            !(self.tag() == Tag::Integer && self.payload() == 0)
        }
    }

    /// The 6-bit tag. Only meaningful when `is_tagged()`; returns `Number`
    /// for untagged floats.
    #[inline(always)]
    pub fn tag(self) -> Tag {
        if self.is_number() {
            Tag::Number
        } else {
            Tag::from_u8(((self.0 & TAG_MASK) >> TAG_SHIFT) as u8)
        }
    }

    /// The 16-bit payload. Only meaningful when `is_tagged()`.
    #[inline(always)]
    pub fn payload(self) -> u16 {
        (self.0 & PAYLOAD_MASK) as u16
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Encode a tag + 16-bit payload into a cell. `tag` must not be `Number`
    /// (that tag value is reserved for untagged floats and is never emitted
    /// by this function — callers who need a float use `from_float`).
    #[inline]
    pub fn encode(tag: Tag, payload: u16) -> TaggedValue {
        debug_assert!(
            !matches!(tag, Tag::Number),
            "Tag::Number cannot be encoded; use from_float"
        );
        TaggedValue(TAGGED_BASE | ((tag as u32) << TAG_SHIFT) | (payload as u32))
    }

    /// Encode a tag with a payload that may exceed 16 bits, range-checking
    /// first.
    pub fn try_encode(tag: Tag, payload: i64) -> Result<TaggedValue, CoreError> {
        if !(0..=0xFFFF).contains(&payload) {
            return Err(CoreError::ValueRange {
                value: payload,
                context: "tagged-value payload must fit in 16 bits",
            });
        }
        Ok(Self::encode(tag, payload as u16))
    }

    /// Encode a signed 16-bit integer as an INTEGER-tagged cell.
    pub fn from_integer(value: i32) -> Result<TaggedValue, CoreError> {
        if !(MIN_INTEGER..=MAX_INTEGER).contains(&value) {
            return Err(CoreError::ValueRange {
                value: value as i64,
                context: "INTEGER payload must fit in a signed 16-bit range",
            });
        }
        Ok(Self::encode(Tag::Integer, value as u16))
    }

    /// Encode an ordinary float32. NaN results are canonicalized so they
    /// never collide with the tagged encoding space.
    #[inline]
    pub fn from_float(f: f32) -> TaggedValue {
        let bits = f.to_bits();
        let candidate = TaggedValue(bits);
        if candidate.is_number() {
            candidate
        } else {
            // The host produced a NaN bit pattern that would otherwise be
            // mistaken for a tagged cell; canonicalize it.
            TaggedValue(CANONICAL_NAN)
        }
    }

    // =========================================================================
    // Extraction
    // =========================================================================

    /// Read this cell as an ordinary float32.
    ///
    /// # Panics
    /// Debug builds assert this cell is actually untagged.
    #[inline]
    pub fn as_float(self) -> f32 {
        debug_assert!(self.is_number(), "as_float called on a tagged cell");
        f32::from_bits(self.0)
    }

    /// Read this cell's payload as a signed 16-bit integer.
    ///
    /// # Panics
    /// Debug builds assert this cell is tagged INTEGER.
    #[inline]
    pub fn as_integer(self) -> i16 {
        debug_assert!(
            matches!(self.tag(), Tag::Integer),
            "as_integer called on a non-INTEGER cell"
        );
        self.payload() as i16
    }

    /// Raw bit pattern, for storage into a segment.
    #[inline(always)]
    pub fn to_bits(self) -> u32 {
        self.0
    }

    /// Reconstruct a cell from its raw bit pattern (as read back from a
    /// segment).
    #[inline(always)]
    pub fn from_bits(bits: u32) -> TaggedValue {
        TaggedValue(bits)
    }
}

impl std::fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_number() {
            write!(f, "Number({})", self.as_float())
        } else {
            match self.tag() {
                Tag::Integer => write!(f, "Integer({})", self.as_integer()),
                Tag::Code => write!(f, "Code({})", self.payload()),
                Tag::String => write!(f, "String(#{})", self.payload()),
                Tag::List => write!(f, "List:{}", self.payload()),
                Tag::Local => write!(f, "Local({})", self.payload()),
                Tag::Builtin => write!(f, "Builtin({})", self.payload()),
                Tag::Sentinel => write!(f, "Sentinel({})", self.payload()),
                Tag::Number => unreachable!(),
            }
        }
    }
}

impl Default for TaggedValue {
    fn default() -> Self {
        NIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_one_cell() {
        assert_eq!(std::mem::size_of::<TaggedValue>(), 4);
    }

    #[test]
    fn nil_is_integer_zero() {
        assert!(NIL.is_nil());
        assert_eq!(NIL.tag(), Tag::Integer);
        assert_eq!(NIL.payload(), 0);
    }

    #[test]
    fn float_roundtrip() {
        for f in [0.0f32, -0.0, 1.0, -123.456, f32::MAX, f32::MIN, 3.14159] {
            let v = TaggedValue::from_float(f);
            assert!(v.is_number());
            assert_eq!(v.as_float(), f);
        }
    }

    #[test]
    fn nan_is_canonicalized_and_still_a_number() {
        let v = TaggedValue::from_float(f32::NAN);
        assert!(v.is_number());
        assert!(v.as_float().is_nan());
    }

    #[test]
    fn infinities_are_numbers_not_tags() {
        let v = TaggedValue::from_float(f32::INFINITY);
        assert!(v.is_number());
        assert!(v.as_float().is_infinite());
        let v = TaggedValue::from_float(f32::NEG_INFINITY);
        assert!(v.is_number());
        assert!(v.as_float().is_infinite());
    }

    #[test]
    fn integer_roundtrip_extremes() {
        for n in [0i32, 1, -1, 32767, -32768, 100, -100] {
            let v = TaggedValue::from_integer(n).unwrap();
            assert_eq!(v.tag(), Tag::Integer);
            assert_eq!(v.as_integer() as i32, n);
        }
    }

    #[test]
    fn integer_out_of_range_errors() {
        assert!(TaggedValue::from_integer(32768).is_err());
        assert!(TaggedValue::from_integer(-32769).is_err());
    }

    #[test]
    fn encode_decode_all_tags() {
        for (tag, payload) in [
            (Tag::Code, 42u16),
            (Tag::String, 7),
            (Tag::List, 0),
            (Tag::List, 3),
            (Tag::Local, 5),
            (Tag::Builtin, 100),
            (Tag::Sentinel, 1),
        ] {
            let v = TaggedValue::encode(tag, payload);
            assert!(v.is_tagged());
            assert_eq!(v.tag(), tag);
            assert_eq!(v.payload(), payload);
        }
    }

    #[test]
    fn try_encode_range_checks() {
        assert!(TaggedValue::try_encode(Tag::Code, 65535).is_ok());
        assert!(TaggedValue::try_encode(Tag::Code, 65536).is_err());
        assert!(TaggedValue::try_encode(Tag::Code, -1).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!NIL.is_truthy());
        assert!(TaggedValue::from_integer(0).unwrap() == NIL);
        assert!(TaggedValue::from_integer(1).unwrap().is_truthy());
        assert!(TaggedValue::from_integer(-1).unwrap().is_truthy());
        assert!(TaggedValue::from_float(0.0).is_truthy() == false);
        assert!(TaggedValue::from_float(1.0).is_truthy());
        assert!(TaggedValue::encode(Tag::List, 0).is_truthy());
    }

    #[test]
    fn bits_roundtrip() {
        let v = TaggedValue::encode(Tag::Code, 1234);
        let bits = v.to_bits();
        let restored = TaggedValue::from_bits(bits);
        assert_eq!(restored.tag(), Tag::Code);
        assert_eq!(restored.payload(), 1234);
    }
}
