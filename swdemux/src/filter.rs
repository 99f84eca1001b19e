//! Section filter rules and the filter chain evaluator.
//!
//! A rule compares the first [`FILTER_SIZE`] bytes of a section against a
//! value under a mask. For each byte the mode selects the comparison: a mode
//! bit of 1 requires the masked bit to be equal, a mode bit of 0 marks a
//! "not equal" bit. A rule with any not-equal bit only matches if at least one
//! of those bits differs.

/// Number of section bytes a filter rule covers.
pub const FILTER_SIZE: usize = 18;

/// User supplied section filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionFilter {
    /// Expected byte values.
    pub value: [u8; FILTER_SIZE],
    /// Bits taking part in the comparison.
    pub mask: [u8; FILTER_SIZE],
    /// Per bit: 1 = must be equal, 0 = must differ (at least one such bit).
    pub mode: [u8; FILTER_SIZE],
}

impl SectionFilter {
    /// Positive match of `value` under `mask`.
    pub fn new(value: [u8; FILTER_SIZE], mask: [u8; FILTER_SIZE]) -> Self {
        Self {
            value,
            mask,
            mode: [0xFF; FILTER_SIZE],
        }
    }

    /// Rule with an explicit mode array.
    pub fn with_mode(value: [u8; FILTER_SIZE], mask: [u8; FILTER_SIZE], mode: [u8; FILTER_SIZE]) -> Self {
        Self { value, mask, mode }
    }

    /// Rule that accepts every section.
    pub fn any() -> Self {
        Self::new([0; FILTER_SIZE], [0; FILTER_SIZE])
    }

    /// Rule that accepts sections with the given `table_id`.
    pub fn table_id(table_id: u8) -> Self {
        let mut value = [0; FILTER_SIZE];
        let mut mask = [0; FILTER_SIZE];
        value[0] = table_id;
        mask[0] = 0xFF;
        Self::new(value, mask)
    }
}

impl Default for SectionFilter {
    fn default() -> Self {
        Self::any()
    }
}

/// Masks derived from a [`SectionFilter`] when filtering starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PreparedFilter {
    value: [u8; FILTER_SIZE],
    /// `mask & mode`: bits that must be equal.
    exact: [u8; FILTER_SIZE],
    /// `mask & !mode`: bits of which at least one must differ.
    inverse: [u8; FILTER_SIZE],
    /// Whether any inverse bit is set.
    not_equal: bool,
}

impl PreparedFilter {
    pub fn prepare(filter: &SectionFilter) -> Self {
        let mut exact = [0u8; FILTER_SIZE];
        let mut inverse = [0u8; FILTER_SIZE];
        let mut any_inverse = 0u8;

        for i in 0..FILTER_SIZE {
            exact[i] = filter.mask[i] & filter.mode[i];
            inverse[i] = filter.mask[i] & !filter.mode[i];
            any_inverse |= inverse[i];
        }

        Self {
            value: filter.value,
            exact,
            inverse,
            not_equal: any_inverse != 0,
        }
    }

    /// Evaluate the rule against a complete section.
    ///
    /// Bytes beyond the end of a short section compare as zero.
    pub fn matches(&self, section: &[u8]) -> bool {
        let mut neq = 0u8;

        for i in 0..FILTER_SIZE {
            let byte = section.get(i).copied().unwrap_or(0);
            let xor = self.value[i] ^ byte;

            if self.exact[i] & xor != 0 {
                return false;
            }

            neq |= self.inverse[i] & xor;
        }

        !self.not_equal || neq != 0
    }
}

impl Default for PreparedFilter {
    fn default() -> Self {
        Self::prepare(&SectionFilter::any())
    }
}
