// The primitive table. A primitive either succeeds (adjusting the stack and
// returning true) or declines (leaving the stack untouched and returning false),
// in which case the interpreter activates the Smalltalk method behind it. Only
// fatal conditions and the quit path come back as errors. Float, large-integer
// and stream primitives always decline here; the image's own code covers them.

use crate::bitblt;
use crate::interpreter::{
    Interpreter, BLOCK_ARGUMENT_COUNT_INDEX, CALLER_INDEX, HOME_INDEX, INITIAL_IP_INDEX,
    INSTANCE_SPECIFICATION_INDEX, IP_INDEX, LITERAL_START, POINT_SIZE, SP_INDEX,
    TEMP_FRAME_START, X_INDEX, Y_INDEX,
};
use crate::oops::{Oop, UNUSED};
use crate::scheduler::ACTIVE_PROCESS_INDEX;
use crate::snapshot;
use crate::VmError;
use log::{error, info};

/// A Character's code lives in its single instance variable.
pub const CHARACTER_VALUE_INDEX: usize = 0;

/// Seconds between 1901-01-01 and the Unix epoch; Smalltalk time counts from the
/// former.
const SMALLTALK_EPOCH_OFFSET: i64 = 2_177_452_800;

enum Subscript {
    Pointers,
    Words,
    Bytes,
}

impl Interpreter {
    pub(crate) fn dispatch_primitive(&mut self, index: u16) -> Result<bool, VmError> {
        match index {
            1..=17 => self.primitive_arithmetic(index),
            18 => self.primitive_make_point(),
            // Large-integer and float arithmetic defers to the image.
            19..=59 => Ok(false),
            60 => self.primitive_at(),
            61 => self.primitive_at_put(),
            62 => self.primitive_size(),
            63 => self.primitive_string_at(),
            64 => self.primitive_string_at_put(),
            // Stream shortcuts are optional; decline them.
            65..=67 => Ok(false),
            68 => self.primitive_object_at(),
            69 => self.primitive_object_at_put(),
            70 => self.primitive_new(),
            71 => self.primitive_new_with_arg(),
            72 => self.primitive_become(),
            73 => self.primitive_inst_var_at(),
            74 => self.primitive_inst_var_at_put(),
            75 => self.primitive_as_oop(),
            76 => self.primitive_as_object(),
            77 => self.primitive_some_instance(),
            78 => self.primitive_next_instance(),
            79 => self.primitive_new_method(),
            80 => self.primitive_block_copy(),
            81 => self.primitive_value(),
            82 => self.primitive_value_with_arguments(),
            83 => self.primitive_perform(),
            84 => self.primitive_perform_with_arguments(),
            85 => self.primitive_signal(),
            86 => self.primitive_wait(),
            87 => self.primitive_resume(),
            88 => self.primitive_suspend(),
            89 => {
                self.flush_method_cache();
                Ok(true)
            }
            90 => self.primitive_mouse_point(),
            91 => self.primitive_cursor_loc_put(),
            92 | 94 => {
                // Cursor linkage and sample interval: acknowledged, nothing to do.
                self.pop(1);
                Ok(true)
            }
            93 => self.primitive_input_semaphore(),
            95 => self.primitive_input_word(),
            96 => bitblt::primitive_copy_bits(self),
            97 => self.primitive_snapshot(),
            98 => self.primitive_time_words_into(),
            99 => self.primitive_tick_words_into(),
            100 => self.primitive_signal_at_tick(),
            101 => self.primitive_be_cursor(),
            102 => self.primitive_be_display(),
            103 => bitblt::primitive_scan_characters(self),
            104 => bitblt::primitive_draw_loop(self),
            105 => self.primitive_string_replace(),
            110 => self.primitive_equivalent(),
            111 => self.primitive_class(),
            112 => self.primitive_core_left(),
            113 => self.primitive_quit(),
            114 => {
                error!("primitiveExitToDebugger: no debugger in this world, quitting");
                self.primitive_quit()
            }
            115 => self.primitive_oops_left(),
            116 => self.primitive_signal_at_low_space(),
            128 => self.primitive_vendor_disk(false),
            129 => self.primitive_vendor_disk(true),
            _ => Ok(false),
        }
    }

    // --- small helpers ------------------------------------------------------

    pub(crate) fn stack_integer(&self, depth: usize) -> Option<i32> {
        let oop = self.stack_value(depth);
        if self.memory.is_integer_object(oop) {
            Some(self.memory.integer_value_of(oop) as i32)
        } else {
            None
        }
    }

    pub(crate) fn push_bool(&mut self, value: bool) {
        let oop = if value { self.memory.wk.true_oop } else { self.memory.wk.false_oop };
        self.push(oop);
    }

    /// A positive value from a small integer or a little-endian
    /// LargePositiveInteger of up to four bytes.
    pub(crate) fn positive_value_of(&self, oop: Oop) -> Option<u32> {
        if self.memory.is_integer_object(oop) {
            let value = self.memory.integer_value_of(oop);
            return if value >= 0 { Some(value as u32) } else { None };
        }
        if self.memory.fetch_class_of(oop) != self.memory.wk.class_large_positive_integer {
            return None;
        }
        let length = self.memory.byte_length_of(oop);
        if length > 4 {
            return None;
        }
        let mut value: u32 = 0;
        for index in (0..length).rev() {
            value = (value << 8) | self.memory.fetch_byte(index, oop) as u32;
        }
        Some(value)
    }

    /// A small integer when the value fits, else a LargePositiveInteger with the
    /// minimal little-endian byte count.
    pub(crate) fn positive_integer_for(&mut self, value: u32) -> Result<Oop, VmError> {
        if value <= i16::MAX as u32 && self.memory.is_integer_value(value as i32) {
            return Ok(self.memory.integer_object_of(value as i16));
        }
        let bytes = if value <= 0xFFFF {
            2
        } else if value <= 0xFF_FFFF {
            3
        } else {
            4
        };
        let class = self.memory.wk.class_large_positive_integer;
        let large = self.instantiate_bytes(class, bytes)?;
        for index in 0..bytes {
            self.memory.store_byte(index, large, (value >> (8 * index)) as u8);
        }
        Ok(large)
    }

    fn instance_specification_of(&self, class: Oop) -> u16 {
        let spec = self.memory.fetch_pointer(INSTANCE_SPECIFICATION_INDEX, class);
        self.memory.integer_value_of(spec) as u16
    }

    /// Indexing geometry of a receiver: fixed-field offset, indexable length and
    /// element kind, per its class's instance specification.
    fn subscript_info(&self, receiver: Oop) -> (usize, usize, Subscript) {
        let class = self.memory.fetch_class_of(receiver);
        let spec = self.instance_specification_of(class);
        let tagging = self.memory.tagging;
        let fixed = tagging.spec_fixed_fields(spec);
        if tagging.spec_is_pointers(spec) {
            (fixed, self.memory.word_length_of(receiver).saturating_sub(fixed), Subscript::Pointers)
        } else if tagging.spec_is_words(spec) {
            (fixed, self.memory.word_length_of(receiver).saturating_sub(fixed), Subscript::Words)
        } else {
            (
                fixed * 2,
                self.memory.byte_length_of(receiver).saturating_sub(fixed * 2),
                Subscript::Bytes,
            )
        }
    }

    // --- arithmetic ---------------------------------------------------------

    fn primitive_arithmetic(&mut self, index: u16) -> Result<bool, VmError> {
        let (Some(a), Some(b)) = (self.stack_integer(1), self.stack_integer(0)) else {
            return Ok(false);
        };
        let result = match index {
            1 => IntResult::int(self, a + b),
            2 => IntResult::int(self, a - b),
            3 => IntResult::Bool(a < b),
            4 => IntResult::Bool(a > b),
            5 => IntResult::Bool(a <= b),
            6 => IntResult::Bool(a >= b),
            7 => IntResult::Bool(a == b),
            8 => IntResult::Bool(a != b),
            9 => IntResult::int(self, a * b),
            10 => {
                if b == 0 || a % b != 0 {
                    return Ok(false);
                }
                IntResult::int(self, a / b)
            }
            11 => {
                if b == 0 {
                    return Ok(false);
                }
                IntResult::int(self, floor_mod(a, b))
            }
            12 => {
                if b == 0 {
                    return Ok(false);
                }
                IntResult::int(self, floor_div(a, b))
            }
            13 => {
                if b == 0 {
                    return Ok(false);
                }
                IntResult::int(self, a / b)
            }
            14 => IntResult::int(self, a & b),
            15 => IntResult::int(self, a | b),
            16 => IntResult::int(self, a ^ b),
            17 => {
                if b > 16 || b < -16 {
                    return Ok(false);
                }
                let shifted = if b >= 0 { (a as i64) << b } else { (a >> (-b)) as i64 };
                if shifted < i32::MIN as i64 || shifted > i32::MAX as i64 {
                    return Ok(false);
                }
                IntResult::int(self, shifted as i32)
            }
            _ => return Ok(false),
        };
        match result {
            IntResult::Fail => Ok(false),
            IntResult::Int(oop) => {
                self.pop(2);
                self.push(oop);
                Ok(true)
            }
            IntResult::Bool(value) => {
                self.pop(2);
                self.push_bool(value);
                Ok(true)
            }
        }
    }

    fn primitive_make_point(&mut self) -> Result<bool, VmError> {
        let x = self.stack_value(1);
        let y = self.stack_value(0);
        if !self.memory.is_integer_object(x) || !self.memory.is_integer_object(y) {
            return Ok(false);
        }
        let class = self.memory.wk.class_point;
        let point = self.instantiate_pointers(class, POINT_SIZE)?;
        self.memory.store_pointer(X_INDEX, point, x);
        self.memory.store_pointer(Y_INDEX, point, y);
        self.pop(2);
        self.push(point);
        self.memory.release_in_hand(point);
        Ok(true)
    }

    // --- indexed access -----------------------------------------------------

    fn primitive_at(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(1);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let Some(index) = self.positive_value_of(self.stack_value(0)) else {
            return Ok(false);
        };
        let (fixed, length, kind) = self.subscript_info(receiver);
        if index < 1 || index as usize > length {
            return Ok(false);
        }
        let slot = fixed + index as usize - 1;
        let value = match kind {
            Subscript::Pointers => self.memory.fetch_pointer(slot, receiver),
            Subscript::Words => {
                let word = self.memory.fetch_word(slot, receiver);
                self.positive_integer_for(word as u32)?
            }
            Subscript::Bytes => {
                let byte = self.memory.fetch_byte(slot, receiver);
                self.memory.integer_object_of(byte as i16)
            }
        };
        self.pop(2);
        self.push(value);
        Ok(true)
    }

    fn primitive_at_put(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(2);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let Some(index) = self.positive_value_of(self.stack_value(1)) else {
            return Ok(false);
        };
        let value = self.stack_value(0);
        let (fixed, length, kind) = self.subscript_info(receiver);
        if index < 1 || index as usize > length {
            return Ok(false);
        }
        let slot = fixed + index as usize - 1;
        match kind {
            Subscript::Pointers => self.memory.store_pointer(slot, receiver, value),
            Subscript::Words => {
                let Some(word) = self.positive_value_of(value) else { return Ok(false) };
                if word > 0xFFFF {
                    return Ok(false);
                }
                self.memory.store_word(slot, receiver, word as u16);
            }
            Subscript::Bytes => {
                let Some(byte) = self.stack_integer(0) else { return Ok(false) };
                if !(0..=255).contains(&byte) {
                    return Ok(false);
                }
                self.memory.store_byte(slot, receiver, byte as u8);
            }
        }
        self.pop(3);
        self.push(value);
        Ok(true)
    }

    fn primitive_size(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(0);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let (_, length, _) = self.subscript_info(receiver);
        let size = self.positive_integer_for(length as u32)?;
        self.pop(1);
        self.push(size);
        Ok(true)
    }

    fn primitive_string_at(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(1);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let Some(index) = self.positive_value_of(self.stack_value(0)) else {
            return Ok(false);
        };
        let (fixed, length, kind) = self.subscript_info(receiver);
        if !matches!(kind, Subscript::Bytes) || index < 1 || index as usize > length {
            return Ok(false);
        }
        let code = self.memory.fetch_byte(fixed + index as usize - 1, receiver) as usize;
        let table = self.memory.wk.character_table;
        let character = self.memory.fetch_pointer(code, table);
        self.pop(2);
        self.push(character);
        Ok(true)
    }

    fn primitive_string_at_put(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(2);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let Some(index) = self.positive_value_of(self.stack_value(1)) else {
            return Ok(false);
        };
        let character = self.stack_value(0);
        if self.memory.fetch_class_of(character) != self.memory.wk.class_character {
            return Ok(false);
        }
        let (fixed, length, kind) = self.subscript_info(receiver);
        if !matches!(kind, Subscript::Bytes) || index < 1 || index as usize > length {
            return Ok(false);
        }
        let code = self
            .memory
            .integer_value_of(self.memory.fetch_pointer(CHARACTER_VALUE_INDEX, character));
        self.memory
            .store_byte(fixed + index as usize - 1, receiver, code as u8);
        self.pop(3);
        self.push(character);
        Ok(true)
    }

    // --- storage management -------------------------------------------------

    fn primitive_object_at(&mut self) -> Result<bool, VmError> {
        let method = self.stack_value(1);
        let Some(index) = self.stack_integer(0) else { return Ok(false) };
        if index < 1 || index as usize > self.literal_count_of(method) + 1 {
            return Ok(false);
        }
        let value = self.memory.fetch_pointer(index as usize - 1, method);
        self.pop(2);
        self.push(value);
        Ok(true)
    }

    fn primitive_object_at_put(&mut self) -> Result<bool, VmError> {
        let method = self.stack_value(2);
        let Some(index) = self.stack_integer(1) else { return Ok(false) };
        let value = self.stack_value(0);
        if index < 1 || index as usize > self.literal_count_of(method) + 1 {
            return Ok(false);
        }
        self.memory.store_pointer(index as usize - 1, method, value);
        self.pop(3);
        self.push(value);
        Ok(true)
    }

    fn primitive_new(&mut self) -> Result<bool, VmError> {
        let class = self.stack_value(0);
        let spec = self.instance_specification_of(class);
        let tagging = self.memory.tagging;
        if tagging.spec_is_indexable(spec) {
            return Ok(false);
        }
        let fixed = tagging.spec_fixed_fields(spec);
        let instance = if tagging.spec_is_pointers(spec) {
            self.instantiate_pointers(class, fixed)?
        } else if tagging.spec_is_words(spec) {
            self.instantiate_words(class, fixed)?
        } else {
            self.instantiate_bytes(class, fixed * 2)?
        };
        self.pop(1);
        self.push(instance);
        self.memory.release_in_hand(instance);
        Ok(true)
    }

    fn primitive_new_with_arg(&mut self) -> Result<bool, VmError> {
        let class = self.stack_value(1);
        let Some(size) = self.positive_value_of(self.stack_value(0)) else {
            return Ok(false);
        };
        let spec = self.instance_specification_of(class);
        let tagging = self.memory.tagging;
        if !tagging.spec_is_indexable(spec) {
            return Ok(false);
        }
        let fixed = tagging.spec_fixed_fields(spec);
        let total = fixed + size as usize;
        if total + 2 > 0xFFFF {
            return Ok(false);
        }
        let instance = if tagging.spec_is_pointers(spec) {
            self.instantiate_pointers(class, total)?
        } else if tagging.spec_is_words(spec) {
            self.instantiate_words(class, total)?
        } else {
            self.instantiate_bytes(class, fixed * 2 + size as usize)?
        };
        self.pop(2);
        self.push(instance);
        self.memory.release_in_hand(instance);
        Ok(true)
    }

    fn primitive_become(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(1);
        let argument = self.stack_value(0);
        if self.memory.is_integer_object(receiver) || self.memory.is_integer_object(argument) {
            return Ok(false);
        }
        self.memory.swap_pointers_of(receiver, argument);
        self.flush_method_cache();
        self.pop(1);
        Ok(true)
    }

    fn primitive_inst_var_at(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(1);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let Some(index) = self.stack_integer(0) else { return Ok(false) };
        let (_, _, kind) = self.subscript_info(receiver);
        let limit = match kind {
            Subscript::Bytes => self.memory.byte_length_of(receiver),
            _ => self.memory.word_length_of(receiver),
        };
        if index < 1 || index as usize > limit {
            return Ok(false);
        }
        let slot = index as usize - 1;
        let value = match kind {
            Subscript::Pointers => self.memory.fetch_pointer(slot, receiver),
            Subscript::Words => {
                let word = self.memory.fetch_word(slot, receiver);
                self.positive_integer_for(word as u32)?
            }
            Subscript::Bytes => {
                let byte = self.memory.fetch_byte(slot, receiver);
                self.memory.integer_object_of(byte as i16)
            }
        };
        self.pop(2);
        self.push(value);
        Ok(true)
    }

    fn primitive_inst_var_at_put(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(2);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let Some(index) = self.stack_integer(1) else { return Ok(false) };
        let value = self.stack_value(0);
        let (_, _, kind) = self.subscript_info(receiver);
        let limit = match kind {
            Subscript::Bytes => self.memory.byte_length_of(receiver),
            _ => self.memory.word_length_of(receiver),
        };
        if index < 1 || index as usize > limit {
            return Ok(false);
        }
        let slot = index as usize - 1;
        match kind {
            Subscript::Pointers => self.memory.store_pointer(slot, receiver, value),
            Subscript::Words => {
                let Some(word) = self.positive_value_of(value) else { return Ok(false) };
                if word > 0xFFFF {
                    return Ok(false);
                }
                self.memory.store_word(slot, receiver, word as u16);
            }
            Subscript::Bytes => {
                let Some(byte) = self.stack_integer(0) else { return Ok(false) };
                if !(0..=255).contains(&byte) {
                    return Ok(false);
                }
                self.memory.store_byte(slot, receiver, byte as u8);
            }
        }
        self.pop(3);
        self.push(value);
        Ok(true)
    }

    /// Classic tagging can quote a pointer as the odd small integer with the
    /// same bits; stretch has no room for that trick, so the image-level code
    /// takes over there.
    fn primitive_as_oop(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(0);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        if self.memory.tagging != crate::oops::Tagging::Classic {
            return Ok(false);
        }
        self.pop(1);
        self.push(receiver | 1);
        Ok(true)
    }

    fn primitive_as_object(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(0);
        if !self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        if self.memory.tagging != crate::oops::Tagging::Classic {
            return Ok(false);
        }
        let oop = receiver & !1;
        if !self.memory.has_object(oop) {
            return Ok(false);
        }
        self.pop(1);
        self.push(oop);
        Ok(true)
    }

    fn primitive_some_instance(&mut self) -> Result<bool, VmError> {
        let class = self.stack_value(0);
        let instance = self.memory.initial_instance_of(class);
        if instance == self.memory.wk.nil {
            return Ok(false);
        }
        self.pop(1);
        self.push(instance);
        Ok(true)
    }

    fn primitive_next_instance(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(0);
        if self.memory.is_integer_object(receiver) {
            return Ok(false);
        }
        let instance = self.memory.instance_after(receiver);
        if instance == self.memory.wk.nil {
            return Ok(false);
        }
        self.pop(1);
        self.push(instance);
        Ok(true)
    }

    fn primitive_new_method(&mut self) -> Result<bool, VmError> {
        let class = self.stack_value(2);
        let Some(bytecode_count) = self.stack_integer(1) else { return Ok(false) };
        let header = self.stack_value(0);
        if !self.memory.is_integer_object(header) || bytecode_count < 0 {
            return Ok(false);
        }
        let literals = self
            .memory
            .tagging
            .literal_count_of(self.memory.integer_value_of(header) as u16);
        let total_bytes = (literals + 1) * 2 + bytecode_count as usize;
        let method = self.instantiate_bytes(class, total_bytes)?;
        self.memory.store_word(0, method, header);
        let nil = self.memory.wk.nil;
        for index in 0..literals {
            self.memory.store_word(LITERAL_START + index, method, nil);
        }
        self.pop(3);
        self.push(method);
        self.memory.release_in_hand(method);
        Ok(true)
    }

    // --- control ------------------------------------------------------------

    fn primitive_block_copy(&mut self) -> Result<bool, VmError> {
        let context = self.stack_value(1);
        let argument_count = self.stack_value(0);
        if !self.memory.is_integer_object(argument_count) {
            return Ok(false);
        }
        let method_context = if self.is_block_context(context) {
            self.memory.fetch_pointer(HOME_INDEX, context)
        } else {
            context
        };
        let size = self.memory.word_length_of(self.active_context);
        let class = self.memory.wk.class_block_context;
        let block = self.instantiate_pointers(class, size)?;
        // The block body starts beyond the two-byte jump that follows this send.
        let initial_ip = self
            .memory
            .integer_object_of(self.instruction_pointer as i16 + 3);
        self.memory.store_pointer(INITIAL_IP_INDEX, block, initial_ip);
        self.memory.store_pointer(IP_INDEX, block, initial_ip);
        self.memory
            .store_pointer(BLOCK_ARGUMENT_COUNT_INDEX, block, argument_count);
        self.memory.store_pointer(HOME_INDEX, block, method_context);
        self.pop(2);
        self.push(block);
        self.memory.release_in_hand(block);
        Ok(true)
    }

    fn primitive_value(&mut self) -> Result<bool, VmError> {
        let argument_count = self.argument_count;
        let block = self.stack_value(argument_count);
        let expected = self
            .memory
            .fetch_pointer(BLOCK_ARGUMENT_COUNT_INDEX, block);
        if !self.memory.is_integer_object(expected)
            || self.memory.integer_value_of(expected) as usize != argument_count
        {
            return Ok(false);
        }
        for index in 0..argument_count {
            let value = self.stack_value(argument_count - 1 - index);
            self.memory
                .store_pointer(TEMP_FRAME_START + index, block, value);
        }
        self.pop(argument_count + 1);
        self.enter_block(block, argument_count);
        Ok(true)
    }

    fn primitive_value_with_arguments(&mut self) -> Result<bool, VmError> {
        let block = self.stack_value(1);
        let arguments = self.stack_value(0);
        if self.memory.is_integer_object(arguments) || !self.memory.pointer_fields_of(arguments) {
            return Ok(false);
        }
        let count = self.memory.word_length_of(arguments);
        let expected = self
            .memory
            .fetch_pointer(BLOCK_ARGUMENT_COUNT_INDEX, block);
        if !self.memory.is_integer_object(expected)
            || self.memory.integer_value_of(expected) as usize != count
        {
            return Ok(false);
        }
        for index in 0..count {
            let value = self.memory.fetch_pointer(index, arguments);
            self.memory
                .store_pointer(TEMP_FRAME_START + index, block, value);
        }
        self.pop(2);
        self.enter_block(block, count);
        Ok(true)
    }

    fn enter_block(&mut self, block: Oop, argument_count: usize) {
        let initial = self.memory.fetch_pointer(INITIAL_IP_INDEX, block);
        self.memory.store_pointer(IP_INDEX, block, initial);
        let sp = self.memory.integer_object_of(argument_count as i16);
        self.memory.store_pointer(SP_INDEX, block, sp);
        let active = self.active_context;
        self.memory.store_pointer(CALLER_INDEX, block, active);
        self.new_active_context(block);
    }

    fn primitive_perform(&mut self) -> Result<bool, VmError> {
        let argument_count = self.argument_count;
        if argument_count == 0 {
            return Ok(false);
        }
        let selector = self.stack_value(argument_count - 1);
        // Squeeze the selector out of the frame so the stack reads
        // receiver, arguments... as an ordinary send expects.
        for index in (0..argument_count - 1).rev() {
            let value = self.stack_value(index);
            let slot = self.stack_pointer - index - 1;
            let context = self.active_context;
            self.memory.store_pointer(slot, context, value);
        }
        self.pop(1);
        let receiver = self.stack_value(argument_count - 1);
        let class = self.memory.fetch_class_of(receiver);
        self.message_selector = selector;
        self.argument_count = argument_count - 1;
        self.send_selector_to_class(class)?;
        Ok(true)
    }

    fn primitive_perform_with_arguments(&mut self) -> Result<bool, VmError> {
        let arguments = self.stack_value(0);
        let selector = self.stack_value(1);
        if self.memory.is_integer_object(arguments) || !self.memory.pointer_fields_of(arguments) {
            return Ok(false);
        }
        let count = self.memory.word_length_of(arguments);
        // Pushing over the slots that held the selector and the array can drop
        // their last counts; keep everything alive until the frame is rebuilt.
        self.memory.suspend_freeing();
        let values: Vec<Oop> = (0..count)
            .map(|index| self.memory.fetch_pointer(index, arguments))
            .collect();
        self.pop(2);
        for value in values {
            self.push(value);
        }
        self.memory.resume_freeing();
        let receiver = self.stack_value(count);
        let class = self.memory.fetch_class_of(receiver);
        self.message_selector = selector;
        self.argument_count = count;
        self.send_selector_to_class(class)?;
        Ok(true)
    }

    // --- processes ----------------------------------------------------------

    fn primitive_signal(&mut self) -> Result<bool, VmError> {
        let semaphore = self.stack_value(0);
        self.synchronous_signal(semaphore);
        Ok(true)
    }

    fn primitive_wait(&mut self) -> Result<bool, VmError> {
        let semaphore = self.stack_value(0);
        self.wait_on(semaphore);
        Ok(true)
    }

    fn primitive_resume(&mut self) -> Result<bool, VmError> {
        let process = self.stack_value(0);
        self.memory.suspend_freeing();
        self.resume_process(process);
        self.memory.resume_freeing();
        Ok(true)
    }

    fn primitive_suspend(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(0);
        let scheduler = self.scheduler_pointer();
        if receiver != self.memory.fetch_pointer(ACTIVE_PROCESS_INDEX, scheduler) {
            return Ok(false);
        }
        self.pop(1);
        let nil = self.memory.wk.nil;
        self.push(nil);
        self.memory.suspend_freeing();
        self.suspend_active();
        self.memory.resume_freeing();
        Ok(true)
    }

    // --- input and time -----------------------------------------------------

    fn primitive_mouse_point(&mut self) -> Result<bool, VmError> {
        let (x, y) = self.display.mouse_point();
        let class = self.memory.wk.class_point;
        let point = self.instantiate_pointers(class, POINT_SIZE)?;
        let x = self.memory.integer_object_of(x);
        let y = self.memory.integer_object_of(y);
        self.memory.store_pointer(X_INDEX, point, x);
        self.memory.store_pointer(Y_INDEX, point, y);
        self.pop(1);
        self.push(point);
        self.memory.release_in_hand(point);
        Ok(true)
    }

    fn primitive_cursor_loc_put(&mut self) -> Result<bool, VmError> {
        let point = self.stack_value(0);
        if self.memory.is_integer_object(point) {
            return Ok(false);
        }
        let x = self.memory.fetch_pointer(X_INDEX, point);
        let y = self.memory.fetch_pointer(Y_INDEX, point);
        if !self.memory.is_integer_object(x) || !self.memory.is_integer_object(y) {
            return Ok(false);
        }
        self.display.set_cursor_position(
            self.memory.integer_value_of(x),
            self.memory.integer_value_of(y),
        );
        self.pop(1);
        Ok(true)
    }

    fn primitive_input_semaphore(&mut self) -> Result<bool, VmError> {
        let semaphore = self.stack_value(0);
        self.input_semaphore = semaphore;
        self.pop(1);
        Ok(true)
    }

    fn primitive_input_word(&mut self) -> Result<bool, VmError> {
        let Some(word) = self.input_queue.pop_front() else {
            return Ok(false);
        };
        let value = self.positive_integer_for(word as u32)?;
        self.pop(1);
        self.push(value);
        Ok(true)
    }

    fn primitive_snapshot(&mut self) -> Result<bool, VmError> {
        self.store_context_registers();
        let roots = self.gc_roots();
        let path = self.snapshot_path.clone();
        snapshot::save_snapshot(&mut self.memory, &roots, &path)?;
        if let Err(problem) = self.disk.save_changes() {
            error!("saving vendor disk changes failed: {}", problem);
        }
        self.flush_method_cache();
        info!("snapshot written to {}", path.display());
        Ok(true)
    }

    fn seconds_since_1901(&self) -> u32 {
        let now = chrono::Utc::now().timestamp();
        (now + self.tz_offset_minutes as i64 * 60 + SMALLTALK_EPOCH_OFFSET) as u32
    }

    fn primitive_time_words_into(&mut self) -> Result<bool, VmError> {
        let seconds = self.seconds_since_1901();
        self.store_clock_words(seconds)
    }

    fn primitive_tick_words_into(&mut self) -> Result<bool, VmError> {
        let ticks = self.millisecond_clock();
        self.store_clock_words(ticks)
    }

    /// The 32-bit clock value lands in the argument byte array, most significant
    /// byte first, matching the word order of the rest of the machine.
    fn store_clock_words(&mut self, value: u32) -> Result<bool, VmError> {
        let target = self.stack_value(0);
        if self.memory.is_integer_object(target) || self.memory.byte_length_of(target) < 4 {
            return Ok(false);
        }
        for index in 0..4 {
            let byte = (value >> (8 * (3 - index))) as u8;
            self.memory.store_byte(index, target, byte);
        }
        self.pop(1);
        Ok(true)
    }

    fn primitive_signal_at_tick(&mut self) -> Result<bool, VmError> {
        let semaphore = self.stack_value(1);
        let Some(tick) = self.positive_value_of(self.stack_value(0)) else {
            return Ok(false);
        };
        self.signal_at_tick(semaphore, tick);
        self.pop(2);
        Ok(true)
    }

    fn primitive_be_cursor(&mut self) -> Result<bool, VmError> {
        let form = self.stack_value(0);
        let bits = self.memory.fetch_pointer(bitblt::FORM_BITS_INDEX, form);
        if self.memory.is_integer_object(bits) || self.memory.word_length_of(bits) < 16 {
            return Ok(false);
        }
        let mut cursor = [0u16; 16];
        for (row, word) in cursor.iter_mut().enumerate() {
            *word = self.memory.fetch_word(row, bits);
        }
        let offset = self.memory.fetch_pointer(bitblt::FORM_OFFSET_INDEX, form);
        let (mut hot_x, mut hot_y) = (0i16, 0i16);
        if !self.memory.is_integer_object(offset) && self.memory.has_object(offset) {
            let x = self.memory.fetch_pointer(X_INDEX, offset);
            let y = self.memory.fetch_pointer(Y_INDEX, offset);
            if self.memory.is_integer_object(x) && self.memory.is_integer_object(y) {
                hot_x = -self.memory.integer_value_of(x);
                hot_y = -self.memory.integer_value_of(y);
            }
        }
        self.display.set_cursor(cursor, hot_x, hot_y);
        Ok(true)
    }

    fn primitive_be_display(&mut self) -> Result<bool, VmError> {
        let form = self.stack_value(0);
        if self.memory.is_integer_object(form) {
            return Ok(false);
        }
        let width = self.memory.fetch_pointer(bitblt::FORM_WIDTH_INDEX, form);
        let height = self.memory.fetch_pointer(bitblt::FORM_HEIGHT_INDEX, form);
        if !self.memory.is_integer_object(width) || !self.memory.is_integer_object(height) {
            return Ok(false);
        }
        let width = self.memory.integer_value_of(width) as usize;
        let height = self.memory.integer_value_of(height) as usize;
        self.memory.increment_count(form);
        if self.display_form != UNUSED {
            self.memory.decrement_count(self.display_form);
        }
        self.display_form = form;
        self.display.configure(width, height);
        self.publish_display_rows(0, height);
        Ok(true)
    }

    /// Pushes the given scan lines of the display form out to the host surface.
    pub(crate) fn publish_display_rows(&mut self, first: usize, last: usize) {
        let form = self.display_form;
        if form == UNUSED || !self.memory.has_object(form) {
            return;
        }
        let width = self
            .memory
            .integer_value_of(self.memory.fetch_pointer(bitblt::FORM_WIDTH_INDEX, form))
            as usize;
        let bits = self.memory.fetch_pointer(bitblt::FORM_BITS_INDEX, form);
        if self.memory.is_integer_object(bits) {
            return;
        }
        let raster = (width + 15) / 16;
        let available = self.memory.word_length_of(bits) / raster.max(1);
        let last = last.min(available);
        if first >= last {
            return;
        }
        let mut rows = Vec::with_capacity((last - first) * raster);
        for line in first..last {
            for word in 0..raster {
                rows.push(self.memory.fetch_word(line * raster + word, bits));
            }
        }
        self.display.copy_bits(&rows, raster, first, last);
    }

    fn primitive_string_replace(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(4);
        let Some(start) = self.positive_value_of(self.stack_value(3)) else { return Ok(false) };
        let Some(stop) = self.positive_value_of(self.stack_value(2)) else { return Ok(false) };
        let replacement = self.stack_value(1);
        let Some(replacement_start) = self.positive_value_of(self.stack_value(0)) else {
            return Ok(false);
        };
        if self.memory.is_integer_object(receiver) || self.memory.is_integer_object(replacement) {
            return Ok(false);
        }
        let (fixed, length, kind) = self.subscript_info(receiver);
        let (rep_fixed, rep_length, rep_kind) = self.subscript_info(replacement);
        if !matches!(
            (&kind, &rep_kind),
            (Subscript::Bytes, Subscript::Bytes)
                | (Subscript::Words, Subscript::Words)
                | (Subscript::Pointers, Subscript::Pointers)
        ) {
            return Ok(false);
        }
        if start < 1 || stop as usize > length || (stop != 0 && stop < start) {
            return Ok(false);
        }
        let count = (stop as i64 - start as i64 + 1).max(0) as usize;
        if replacement_start < 1 || replacement_start as usize + count - 1 > rep_length {
            return Ok(false);
        }
        for offset in 0..count {
            let from = rep_fixed + replacement_start as usize - 1 + offset;
            let to = fixed + start as usize - 1 + offset;
            match kind {
                Subscript::Bytes => {
                    let byte = self.memory.fetch_byte(from, replacement);
                    self.memory.store_byte(to, receiver, byte);
                }
                Subscript::Words => {
                    let word = self.memory.fetch_word(from, replacement);
                    self.memory.store_word(to, receiver, word);
                }
                Subscript::Pointers => {
                    let value = self.memory.fetch_pointer(from, replacement);
                    self.memory.store_pointer(to, receiver, value);
                }
            }
        }
        self.pop(4);
        Ok(true)
    }

    // --- system -------------------------------------------------------------

    fn primitive_equivalent(&mut self) -> Result<bool, VmError> {
        let argument = self.stack_value(0);
        let receiver = self.stack_value(1);
        self.pop(2);
        self.push_bool(receiver == argument);
        Ok(true)
    }

    fn primitive_class(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(0);
        let class = self.memory.fetch_class_of(receiver);
        self.pop(1);
        self.push(class);
        Ok(true)
    }

    fn primitive_core_left(&mut self) -> Result<bool, VmError> {
        let free = self.memory.free_heap_words() as u32;
        let value = self.positive_integer_for(free)?;
        self.pop(1);
        self.push(value);
        Ok(true)
    }

    fn primitive_quit(&mut self) -> Result<bool, VmError> {
        if let Err(problem) = self.disk.save_changes() {
            error!("saving vendor disk changes failed: {}", problem);
        }
        Err(VmError::Quit)
    }

    fn primitive_oops_left(&mut self) -> Result<bool, VmError> {
        let free = self.memory.free_table_slots() as u32;
        let value = self.positive_integer_for(free)?;
        self.pop(1);
        self.push(value);
        Ok(true)
    }

    fn primitive_signal_at_low_space(&mut self) -> Result<bool, VmError> {
        let semaphore = self.stack_value(2);
        let Some(oops) = self.positive_value_of(self.stack_value(1)) else { return Ok(false) };
        let Some(words) = self.positive_value_of(self.stack_value(0)) else { return Ok(false) };
        self.low_space_semaphore = if semaphore == self.memory.wk.nil { UNUSED } else { semaphore };
        self.low_space_oops = oops as usize;
        self.low_space_words = words as usize;
        self.pop(3);
        Ok(true)
    }

    /// The two vendor primitives behind which the emulated disk subsystem lives.
    fn primitive_vendor_disk(&mut self, transfer: bool) -> Result<bool, VmError> {
        let argument_count = self.argument_count;
        let receiver = self.stack_value(argument_count);
        let mut arguments = Vec::with_capacity(argument_count);
        for index in 0..argument_count {
            arguments.push(self.stack_value(argument_count - 1 - index));
        }
        let mut disk = std::mem::replace(&mut self.disk, Box::new(crate::display::NullDisk));
        let outcome = if transfer {
            disk.transfer(&mut self.memory, receiver, &arguments)
        } else {
            disk.control(&mut self.memory, receiver, &arguments)
        };
        self.disk = disk;
        match outcome {
            Some(result) => {
                self.pop(argument_count + 1);
                self.push(result);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

enum IntResult {
    Int(Oop),
    Bool(bool),
    Fail,
}

impl IntResult {
    fn int(interp: &Interpreter, value: i32) -> IntResult {
        if interp.memory.is_integer_value(value) {
            IntResult::Int(interp.memory.integer_object_of(value as i16))
        } else {
            IntResult::Fail
        }
    }
}

/// Floored division, the `//` of the sources: rounds toward negative infinity.
fn floor_div(a: i32, b: i32) -> i32 {
    let quotient = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        quotient - 1
    } else {
        quotient
    }
}

/// Floored modulus, the `\\` of the sources: takes the divisor's sign.
fn floor_mod(a: i32, b: i32) -> i32 {
    a - floor_div(a, b) * b
}
