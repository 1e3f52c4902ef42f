//! Tagged Value Words
//!
//! Every runtime value is a single machine word. Heap blocks are 8-byte
//! aligned, so the two low-order bits of a real pointer are always zero;
//! we use them as a tag:
//!
//! ```text
//! ....00  pointer to a heap block (0 itself is the undefined value)
//! ....01  small integer (smi): the upper word_size-2 bits, sign extended
//! ```
//!
//! Small integers never touch the heap. Polymorphic operations on a smi
//! dispatch through the global integer form (see `val::Val::form`).

/// Number of low-order tag bits. Heap blocks are 8-byte aligned so two
/// bits are always available.
pub const NTAG_BITS: u32 = 2;

/// Mask selecting the tag bits.
pub const TAG_MASK: usize = (1 << NTAG_BITS) - 1;

/// Tag value marking a small integer.
pub const SMI_TAG: usize = 1;

/// Tag value marking a pointer (or null).
pub const PTR_TAG: usize = 0;

/// Number of payload bits available to a smi.
pub const NSMI_BITS: u32 = usize::BITS - NTAG_BITS;

/// A tagged value word: smi, heap pointer, or null (undefined).
///
/// `Val` is deliberately `Copy`; reference counting is explicit through
/// `inc_ref`/`dec_ref` (defined in `val`), exactly like the word it models.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Val(usize);

impl Val {
    /// The undefined value.
    pub const NULL: Val = Val(0);

    // =========================================================================
    // Testers
    // =========================================================================

    /// Undefined?
    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer-tagged (includes null)?
    #[inline(always)]
    pub fn is_ptr(self) -> bool {
        self.0 & TAG_MASK == PTR_TAG
    }

    /// Small integer?
    #[inline(always)]
    pub fn is_smi(self) -> bool {
        self.0 & TAG_MASK == SMI_TAG
    }

    /// Does `x` fit in the smi payload bits?
    #[inline(always)]
    pub fn fits_smi(x: i64) -> bool {
        ((x << NTAG_BITS) >> NTAG_BITS) == x
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Encode a small integer.
    ///
    /// # Panics
    /// Debug-asserts that `x` fits in `NSMI_BITS` bits.
    #[inline(always)]
    pub fn from_smi(x: i64) -> Val {
        debug_assert!(Val::fits_smi(x), "smi overflow: {x}");
        Val(((x << NTAG_BITS) | SMI_TAG as i64) as usize)
    }

    /// Encode a heap block pointer.
    #[inline(always)]
    pub fn from_raw_ptr(p: *mut u8) -> Val {
        debug_assert_eq!(p as usize & TAG_MASK, PTR_TAG, "unaligned heap block");
        Val(p as usize)
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// Decode a small integer (arithmetic shift restores the sign).
    #[inline(always)]
    pub fn as_smi(self) -> i64 {
        debug_assert!(self.is_smi(), "as_smi() on non-smi");
        (self.0 as i64) >> NTAG_BITS
    }

    /// Raw pointer to the heap block.
    #[inline(always)]
    pub fn as_raw_ptr(self) -> *mut u8 {
        debug_assert!(self.is_ptr() && !self.is_null(), "as_raw_ptr() on non-pointer");
        self.0 as *mut u8
    }

    /// The raw word, used as a relocation key during compaction.
    #[inline(always)]
    pub fn raw(self) -> usize {
        self.0
    }

    /// Rebuild from a raw word.
    ///
    /// # Safety
    /// `word` must be null, a valid smi encoding, or a pointer to a live
    /// heap block.
    #[inline(always)]
    pub unsafe fn from_raw(word: usize) -> Val {
        Val(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_val_is_one_word() {
        assert_eq!(std::mem::size_of::<Val>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn test_null() {
        let v = Val::NULL;
        assert!(v.is_null());
        assert!(v.is_ptr());
        assert!(!v.is_smi());
    }

    #[test]
    fn test_smi_roundtrip() {
        for &x in &[0i64, 1, -1, 42, -42, 1 << 40, -(1 << 40)] {
            let v = Val::from_smi(x);
            assert!(v.is_smi());
            assert!(!v.is_ptr());
            assert_eq!(v.as_smi(), x);
        }
    }

    #[test]
    fn test_fits_smi_boundaries() {
        let max = (1i64 << (NSMI_BITS - 1)) - 1;
        let min = -(1i64 << (NSMI_BITS - 1));
        assert!(Val::fits_smi(max));
        assert!(Val::fits_smi(min));
        assert!(!Val::fits_smi(max + 1));
        assert!(!Val::fits_smi(min - 1));
        assert!(!Val::fits_smi(i64::MAX));
        assert!(!Val::fits_smi(i64::MIN));

        assert_eq!(Val::from_smi(max).as_smi(), max);
        assert_eq!(Val::from_smi(min).as_smi(), min);
    }

    #[test]
    fn test_ptr_tag() {
        let mut block = [0u64; 4];
        let v = Val::from_raw_ptr(block.as_mut_ptr() as *mut u8);
        assert!(v.is_ptr());
        assert!(!v.is_smi());
        assert!(!v.is_null());
        assert_eq!(v.as_raw_ptr(), block.as_mut_ptr() as *mut u8);
    }
}
