use crate::Value;

/// Layout type tag stored in bits 0..4 of the format word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Instance = 0,
    Class,
    Array,
    ByteArray,
    Str,
    Double,
    LargeInteger,
    Boxed,
    Stack,
    Coroutine,
    Function,
    Initializer,
}

impl TypeTag {
    pub const COUNT: usize = Self::Initializer as usize + 1;

    /// Convert raw bits to a type tag without a bounds check.
    ///
    /// # Safety
    ///
    /// `bits` must be a valid tag value (`< TypeTag::COUNT`).
    #[inline(always)]
    pub unsafe fn from_bits_unchecked(bits: u8) -> Self {
        debug_assert!((bits as usize) < Self::COUNT, "invalid type tag: {bits}");
        core::mem::transmute::<u8, TypeTag>(bits)
    }
}

const TYPE_BITS: u64 = 4;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;
const SIZE_SHIFT: u64 = TYPE_BITS;
const SIZE_BITS: u64 = 12;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const IMMUTABLE_SHIFT: u64 = SIZE_SHIFT + SIZE_BITS;

/// The packed format word carried by every [`Class`](crate::Class), stored
/// as a smi so the class can live in an ordinary tagged slot.
///
/// ```text
/// bits 0..4:   type tag
/// bits 4..16:  fixed size in words (header included; 0 for variable-sized)
/// bit  16:     instances are immutable by format
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct InstanceFormat(u64);

impl InstanceFormat {
    #[inline]
    pub const fn new(tag: TypeTag, fixed_size_words: usize, immutable: bool) -> Self {
        let bits = (tag as u64)
            | (((fixed_size_words as u64) & SIZE_MASK) << SIZE_SHIFT)
            | ((immutable as u64) << IMMUTABLE_SHIFT);
        Self(bits)
    }

    /// Format for an ordinary instance with `fields` reference slots.
    /// The fixed size counts the class word and the flags word.
    #[inline]
    pub const fn instance(fields: usize) -> Self {
        Self::new(TypeTag::Instance, 2 + fields, false)
    }

    #[inline]
    pub const fn class() -> Self {
        // class word, format, superclass, methods, id
        Self::new(TypeTag::Class, 5, true)
    }

    #[inline]
    pub const fn array() -> Self {
        Self::new(TypeTag::Array, 0, false)
    }

    #[inline]
    pub const fn byte_array() -> Self {
        Self::new(TypeTag::ByteArray, 0, false)
    }

    #[inline]
    pub const fn string() -> Self {
        Self::new(TypeTag::Str, 0, true)
    }

    #[inline]
    pub const fn double() -> Self {
        Self::new(TypeTag::Double, 2, true)
    }

    #[inline]
    pub const fn large_integer() -> Self {
        Self::new(TypeTag::LargeInteger, 2, true)
    }

    #[inline]
    pub const fn boxed() -> Self {
        Self::new(TypeTag::Boxed, 2, false)
    }

    #[inline]
    pub const fn stack() -> Self {
        Self::new(TypeTag::Stack, 0, false)
    }

    #[inline]
    pub const fn coroutine() -> Self {
        // class word, flags, stack, caller
        Self::new(TypeTag::Coroutine, 4, false)
    }

    #[inline]
    pub const fn function() -> Self {
        Self::new(TypeTag::Function, 0, true)
    }

    #[inline]
    pub const fn initializer() -> Self {
        Self::new(TypeTag::Initializer, 2, true)
    }

    #[inline(always)]
    pub fn type_tag(self) -> TypeTag {
        // SAFETY: constructed only through the checked constructors above.
        unsafe { TypeTag::from_bits_unchecked((self.0 & TYPE_MASK) as u8) }
    }

    /// Fixed object size in words, including the class word. Zero for
    /// variable-sized layouts (array, byte-array, string, stack, function).
    #[inline(always)]
    pub fn fixed_size_words(self) -> usize {
        ((self.0 >> SIZE_SHIFT) & SIZE_MASK) as usize
    }

    /// Number of reference fields of an ordinary instance.
    #[inline(always)]
    pub fn instance_fields(self) -> usize {
        debug_assert_eq!(self.type_tag(), TypeTag::Instance);
        self.fixed_size_words() - 2
    }

    /// Whether every object of this format is immutable regardless of its
    /// per-instance flag (doubles, strings, large integers, functions, ...).
    #[inline(always)]
    pub fn is_immutable(self) -> bool {
        (self.0 >> IMMUTABLE_SHIFT) & 1 != 0
    }

    #[inline(always)]
    pub fn as_value(self) -> Value {
        Value::from_smi(self.0 as i64)
    }

    /// # Safety
    ///
    /// `value` must be a smi produced by [`InstanceFormat::as_value`].
    #[inline(always)]
    pub unsafe fn from_value(value: Value) -> Self {
        Self(value.to_smi() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_packs_and_unpacks() {
        let f = InstanceFormat::instance(3);
        assert_eq!(f.type_tag(), TypeTag::Instance);
        assert_eq!(f.fixed_size_words(), 5);
        assert_eq!(f.instance_fields(), 3);
        assert!(!f.is_immutable());

        let s = InstanceFormat::string();
        assert_eq!(s.type_tag(), TypeTag::Str);
        assert_eq!(s.fixed_size_words(), 0);
        assert!(s.is_immutable());
    }

    #[test]
    fn format_survives_smi_round_trip() {
        for f in [
            InstanceFormat::instance(0),
            InstanceFormat::class(),
            InstanceFormat::array(),
            InstanceFormat::double(),
            InstanceFormat::coroutine(),
            InstanceFormat::function(),
        ] {
            let v = f.as_value();
            assert!(v.is_smi());
            let back = unsafe { InstanceFormat::from_value(v) };
            assert_eq!(back, f);
        }
    }
}
