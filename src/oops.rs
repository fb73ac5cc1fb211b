// Here reside the definitions of object pointer tags, well-known pointers and the
// scheme-dependent header fields; rather than have magic numbers everywhere, we opt
// for rich types wherever it is not too ridiculous. The object memory then becomes
// the naturally messy code responsible for honoring said rich types.

use std::fmt;

/// A 16-bit tagged object pointer. Small integers are immediate; everything else
/// indexes the object table.
pub type Oop = u16;

/// Oop 0 never names a heap object in either tagging scheme and doubles as the
/// free-list terminator inside heap chunks.
pub const UNUSED: Oop = 0;

/// Number of header words in front of every heap object (size, class).
pub const HEADER_WORDS: usize = 2;

/// The two small-integer tagging schemes an image may use. Detected at load time
/// from the tag of nil's class-pointer word; all conversions and the scheme-sensitive
/// header layouts dispatch through here instead of being inlined at the call sites.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tagging {
    /// Least significant bit set means small integer; value is the upper 15 bits.
    Classic,
    /// Two least significant zero bits mean small integer; value is the upper 14 bits.
    Stretch,
}

impl Tagging {
    pub fn is_integer_object(&self, oop: Oop) -> bool {
        match self {
            Self::Classic => oop & 1 == 1,
            Self::Stretch => oop & 3 == 0,
        }
    }

    pub fn integer_value_of(&self, oop: Oop) -> i16 {
        match self {
            Self::Classic => (oop as i16) >> 1,
            Self::Stretch => (oop as i16) >> 2,
        }
    }

    pub fn integer_object_of(&self, value: i16) -> Oop {
        match self {
            Self::Classic => ((value << 1) | 1) as Oop,
            Self::Stretch => (value << 2) as Oop,
        }
    }

    pub fn is_integer_value(&self, value: i32) -> bool {
        match self {
            Self::Classic => (-0x4000..0x4000).contains(&value),
            Self::Stretch => (-0x2000..0x2000).contains(&value),
        }
    }

    /// Number of linear object-table slots that name heap objects; the small-integer
    /// singletons follow them in linear order.
    pub fn object_slots(&self) -> usize {
        match self {
            Self::Classic => 0x8000,
            Self::Stretch => 0xC000,
        }
    }

    /// Position of an oop in the linear object table: heap objects first, in oop
    /// order, then the small-integer singletons.
    pub fn linear_of(&self, oop: Oop) -> usize {
        let oop = oop as usize;
        match self {
            Self::Classic => {
                if oop & 1 == 0 {
                    oop >> 1
                } else {
                    self.object_slots() + (oop >> 1)
                }
            }
            Self::Stretch => {
                if oop & 3 == 0 {
                    self.object_slots() + (oop >> 2)
                } else {
                    oop - 1 - (oop >> 2)
                }
            }
        }
    }

    /// Inverse of `linear_of` for heap-object slots.
    pub fn oop_of_linear(&self, linear: usize) -> Oop {
        match self {
            Self::Classic => (linear << 1) as Oop,
            Self::Stretch => (linear + linear / 3 + 1) as Oop,
        }
    }

    /// The fixed pointers of the object model under this scheme.
    pub fn well_known(&self) -> WellKnown {
        match self {
            Self::Classic => WellKnown::classic(),
            Self::Stretch => WellKnown::stretch(),
        }
    }

    // Compiled method headers are small integers; the field widths below operate on
    // the *value* of that integer. The literal count loses a bit under Stretch
    // because the payload is one bit narrower.

    pub fn literal_count_of(&self, header_value: u16) -> usize {
        match self {
            Self::Classic => (header_value & 0x3F) as usize,
            Self::Stretch => (header_value & 0x1F) as usize,
        }
    }

    pub fn large_context_flag_of(&self, header_value: u16) -> bool {
        match self {
            Self::Classic => header_value & 0x40 != 0,
            Self::Stretch => header_value & 0x20 != 0,
        }
    }

    pub fn temporary_count_of(&self, header_value: u16) -> usize {
        match self {
            Self::Classic => ((header_value >> 7) & 0x1F) as usize,
            Self::Stretch => ((header_value >> 6) & 0x1F) as usize,
        }
    }

    pub fn flag_value_of(&self, header_value: u16) -> usize {
        match self {
            Self::Classic => ((header_value >> 12) & 7) as usize,
            Self::Stretch => ((header_value >> 11) & 7) as usize,
        }
    }

    /// For flag value 6, the returned instance variable index lives in the
    /// temporary count field.
    pub fn field_index_of(&self, header_value: u16) -> usize {
        self.temporary_count_of(header_value)
    }

    // The header extension (the next-to-last literal when flag value is 7) packs
    // the argument count above an 8-bit primitive index in both schemes.

    pub fn argument_count_of_extension(&self, extension_value: u16) -> usize {
        ((extension_value >> 8) & 0x1F) as usize
    }

    pub fn primitive_index_of_extension(&self, extension_value: u16) -> u16 {
        extension_value & 0xFF
    }

    // Class instance specifications are small integers as well: pointer/word/
    // indexable bits above the fixed-field count, which loses a bit under Stretch.

    pub fn spec_is_pointers(&self, spec_value: u16) -> bool {
        match self {
            Self::Classic => spec_value & 0x4000 != 0,
            Self::Stretch => spec_value & 0x2000 != 0,
        }
    }

    pub fn spec_is_words(&self, spec_value: u16) -> bool {
        match self {
            Self::Classic => spec_value & 0x2000 != 0,
            Self::Stretch => spec_value & 0x1000 != 0,
        }
    }

    pub fn spec_is_indexable(&self, spec_value: u16) -> bool {
        match self {
            Self::Classic => spec_value & 0x1000 != 0,
            Self::Stretch => spec_value & 0x0800 != 0,
        }
    }

    pub fn spec_fixed_fields(&self, spec_value: u16) -> usize {
        match self {
            Self::Classic => (spec_value & 0x7FF) as usize,
            Self::Stretch => (spec_value & 0x3FF) as usize,
        }
    }
}

impl fmt::Display for Tagging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "classic"),
            Self::Stretch => write!(f, "stretch"),
        }
    }
}

/// The table of fixed object pointers. The classic values are the published ones;
/// the stretch image relocates every heap pointer to `2n - 2` so it stays clear of
/// the wider small-integer space. A few entries (compiled-method class, symbol
/// class) are not fixed by the image format and get discovered after loading.
#[derive(Debug, Clone)]
pub struct WellKnown {
    pub nil: Oop,
    pub false_oop: Oop,
    pub true_oop: Oop,
    pub scheduler_association: Oop,
    pub class_small_integer: Oop,
    pub class_string: Oop,
    pub class_array: Oop,
    pub class_float: Oop,
    pub class_method_context: Oop,
    pub class_block_context: Oop,
    pub class_point: Oop,
    pub class_large_positive_integer: Oop,
    pub class_semaphore: Oop,
    pub class_message: Oop,
    pub class_character: Oop,
    pub selector_does_not_understand: Oop,
    pub selector_cannot_return: Oop,
    pub selector_must_be_boolean: Oop,
    pub special_selectors: Oop,
    pub character_table: Oop,
    pub minus_one: Oop,
    pub zero: Oop,
    pub one: Oop,
    pub two: Oop,
    // Discovered at image load; UNUSED until then.
    pub class_compiled_method: Oop,
    pub class_symbol: Oop,
}

impl WellKnown {
    pub fn classic() -> Self {
        let t = Tagging::Classic;
        WellKnown {
            nil: 0x02,
            false_oop: 0x04,
            true_oop: 0x06,
            scheduler_association: 0x08,
            class_small_integer: 0x0C,
            class_string: 0x0E,
            class_array: 0x10,
            class_float: 0x14,
            class_method_context: 0x16,
            class_block_context: 0x18,
            class_point: 0x1A,
            class_large_positive_integer: 0x1C,
            class_semaphore: 0x26,
            class_message: 0x20,
            class_character: 0x28,
            selector_does_not_understand: 0x2A,
            selector_cannot_return: 0x2C,
            selector_must_be_boolean: 0x34,
            special_selectors: 0x30,
            character_table: 0x32,
            minus_one: t.integer_object_of(-1),
            zero: t.integer_object_of(0),
            one: t.integer_object_of(1),
            two: t.integer_object_of(2),
            class_compiled_method: UNUSED,
            class_symbol: UNUSED,
        }
    }

    pub fn stretch() -> Self {
        let classic = Self::classic();
        let t = Tagging::Stretch;
        let relocate = |oop: Oop| oop * 2 - 2;
        WellKnown {
            nil: relocate(classic.nil),
            false_oop: relocate(classic.false_oop),
            true_oop: relocate(classic.true_oop),
            scheduler_association: relocate(classic.scheduler_association),
            class_small_integer: relocate(classic.class_small_integer),
            class_string: relocate(classic.class_string),
            class_array: relocate(classic.class_array),
            class_float: relocate(classic.class_float),
            class_method_context: relocate(classic.class_method_context),
            class_block_context: relocate(classic.class_block_context),
            class_point: relocate(classic.class_point),
            class_large_positive_integer: relocate(classic.class_large_positive_integer),
            class_semaphore: relocate(classic.class_semaphore),
            class_message: relocate(classic.class_message),
            class_character: relocate(classic.class_character),
            selector_does_not_understand: relocate(classic.selector_does_not_understand),
            selector_cannot_return: relocate(classic.selector_cannot_return),
            selector_must_be_boolean: relocate(classic.selector_must_be_boolean),
            special_selectors: relocate(classic.special_selectors),
            character_table: relocate(classic.character_table),
            minus_one: t.integer_object_of(-1),
            zero: t.integer_object_of(0),
            one: t.integer_object_of(1),
            two: t.integer_object_of(2),
            class_compiled_method: UNUSED,
            class_symbol: UNUSED,
        }
    }

    /// Every heap pointer in the table, for use as garbage collection roots.
    pub fn roots(&self) -> Vec<Oop> {
        let mut roots = vec![
            self.nil,
            self.false_oop,
            self.true_oop,
            self.scheduler_association,
            self.class_small_integer,
            self.class_string,
            self.class_array,
            self.class_float,
            self.class_method_context,
            self.class_block_context,
            self.class_point,
            self.class_large_positive_integer,
            self.class_semaphore,
            self.class_message,
            self.class_character,
            self.selector_does_not_understand,
            self.selector_cannot_return,
            self.selector_must_be_boolean,
            self.special_selectors,
            self.character_table,
        ];
        if self.class_compiled_method != UNUSED {
            roots.push(self.class_compiled_method);
        }
        if self.class_symbol != UNUSED {
            roots.push(self.class_symbol);
        }
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trip_classic() {
        let t = Tagging::Classic;
        for v in [-16384i16, -1, 0, 1, 2, 42, 16383] {
            let oop = t.integer_object_of(v);
            assert!(t.is_integer_object(oop));
            assert_eq!(t.integer_value_of(oop), v);
        }
        assert!(t.is_integer_value(16383));
        assert!(!t.is_integer_value(16384));
        assert!(!t.is_integer_value(-16385));
    }

    #[test]
    fn integer_round_trip_stretch() {
        let t = Tagging::Stretch;
        for v in [-8192i16, -1, 0, 1, 2, 42, 8191] {
            let oop = t.integer_object_of(v);
            assert!(t.is_integer_object(oop));
            assert_eq!(t.integer_value_of(oop), v);
        }
        assert!(!t.is_integer_value(8192));
        assert!(!t.is_integer_value(-8193));
    }

    #[test]
    fn pointers_and_integers_partition_the_oop_space() {
        for t in [Tagging::Classic, Tagging::Stretch] {
            let mut objects = 0usize;
            for oop in 0..=0xFFFFu32 {
                if !t.is_integer_object(oop as Oop) {
                    objects += 1;
                }
            }
            assert_eq!(objects, t.object_slots());
        }
    }

    #[test]
    fn linear_mapping_is_a_bijection() {
        for t in [Tagging::Classic, Tagging::Stretch] {
            let mut linear = 0usize;
            for oop in 0..=0xFFFFu32 {
                let oop = oop as Oop;
                if t.is_integer_object(oop) {
                    continue;
                }
                assert_eq!(t.linear_of(oop), linear, "{} oop {:04x}", t, oop);
                assert_eq!(t.oop_of_linear(linear), oop, "{} linear {}", t, linear);
                linear += 1;
            }
        }
        // Oop 0 is a heap slot under classic (linear 0) and a small integer under stretch.
        assert_eq!(Tagging::Classic.linear_of(0), 0);
        assert!(Tagging::Stretch.is_integer_object(0));
    }

    #[test]
    fn method_header_fields() {
        // flag 7, 3 temporaries, small context, 2 literals.
        let value: u16 = (7 << 12) | (3 << 7) | 2;
        let t = Tagging::Classic;
        assert_eq!(t.flag_value_of(value), 7);
        assert_eq!(t.temporary_count_of(value), 3);
        assert!(!t.large_context_flag_of(value));
        assert_eq!(t.literal_count_of(value), 2);

        let extension: u16 = (1 << 8) | 96;
        assert_eq!(t.argument_count_of_extension(extension), 1);
        assert_eq!(t.primitive_index_of_extension(extension), 96);
    }

    #[test]
    fn stretch_well_known_pointers_are_valid_heap_pointers() {
        let t = Tagging::Stretch;
        for oop in t.well_known().roots() {
            assert!(!t.is_integer_object(oop), "{:04x} collides with an integer", oop);
        }
        assert_eq!(t.well_known().nil, Tagging::Classic.well_known().nil);
    }
}
