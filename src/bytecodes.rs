// This is where the dirty grunt work of making sense of the bytecode stream
// happens. The ranges follow the published instruction set: pushes, stores,
// returns, extended forms, jumps, and the three flavors of sends.

use crate::interpreter::{Interpreter, SUPERCLASS_INDEX, TEMP_FRAME_START, VALUE_INDEX};
use crate::oops::Oop;
use crate::VmError;
use log::error;

/// Primitive attempted for each of the sixteen arithmetic special selectors
/// (bytecodes 176..=191): + - < > <= >= = ~= * / \\ @ bitShift: // bitAnd: bitOr:.
const ARITHMETIC_PRIMITIVES: [u16; 16] =
    [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 18, 17, 12, 14, 15];

impl Interpreter {
    pub(crate) fn dispatch_bytecode(&mut self, byte: u8) -> Result<(), VmError> {
        match byte {
            0..=15 => {
                let value = self
                    .memory
                    .fetch_pointer((byte & 0x0F) as usize, self.receiver);
                self.push(value);
                Ok(())
            }
            16..=31 => {
                let value = self.temporary((byte & 0x0F) as usize);
                self.push(value);
                Ok(())
            }
            32..=63 => {
                let value = self.literal((byte & 0x1F) as usize, self.method);
                self.push(value);
                Ok(())
            }
            64..=95 => {
                let association = self.literal((byte & 0x1F) as usize, self.method);
                let value = self.memory.fetch_pointer(VALUE_INDEX, association);
                self.push(value);
                Ok(())
            }
            96..=103 => {
                let value = self.pop_stack();
                let receiver = self.receiver;
                self.memory
                    .store_pointer((byte & 0x07) as usize, receiver, value);
                Ok(())
            }
            104..=111 => {
                let value = self.pop_stack();
                self.store_temporary((byte & 0x07) as usize, value);
                Ok(())
            }
            112..=119 => {
                let value = self.special_constant(byte - 112);
                self.push(value);
                Ok(())
            }
            120..=123 => {
                let result = self.special_constant_for_return(byte - 120);
                let target = self.home_sender();
                self.return_value(result, target)
            }
            124 => {
                let result = self.pop_stack();
                let target = self.home_sender();
                self.return_value(result, target)
            }
            125 => {
                let result = self.pop_stack();
                let target = self.caller();
                self.return_value(result, target)
            }
            128 => self.extended_push(),
            129 => self.extended_store(false),
            130 => self.extended_store(true),
            131 => {
                let descriptor = self.next_byte();
                let selector = self.literal((descriptor & 0x1F) as usize, self.method);
                self.send_selector(selector, (descriptor >> 5) as usize)
            }
            132 => {
                let count = self.next_byte() as usize;
                let index = self.next_byte() as usize;
                let selector = self.literal(index, self.method);
                self.send_selector(selector, count)
            }
            133 => {
                let descriptor = self.next_byte();
                let selector = self.literal((descriptor & 0x1F) as usize, self.method);
                self.send_super(selector, (descriptor >> 5) as usize)
            }
            134 => {
                let count = self.next_byte() as usize;
                let index = self.next_byte() as usize;
                let selector = self.literal(index, self.method);
                self.send_super(selector, count)
            }
            135 => {
                self.pop(1);
                Ok(())
            }
            136 => {
                let top = self.stack_top();
                self.push(top);
                Ok(())
            }
            137 => {
                let active = self.active_context;
                self.push(active);
                Ok(())
            }
            144..=151 => {
                self.jump((byte & 0x07) as isize + 1);
                Ok(())
            }
            152..=159 => self.jump_unless((byte & 0x07) as isize + 1, false),
            160..=167 => {
                let low = self.next_byte() as isize;
                self.jump((((byte & 0x07) as isize) - 4) * 256 + low);
                Ok(())
            }
            168..=171 => {
                let low = self.next_byte() as isize;
                self.jump_unless(((byte & 0x03) as isize) * 256 + low, true)
            }
            172..=175 => {
                let low = self.next_byte() as isize;
                self.jump_unless(((byte & 0x03) as isize) * 256 + low, false)
            }
            176..=191 => self.send_arithmetic_selector(byte - 176),
            192..=207 => self.send_common_selector(byte - 176),
            208..=255 => {
                let selector = self.literal((byte & 0x0F) as usize, self.method);
                self.send_selector(selector, ((byte - 208) >> 4) as usize)
            }
            _ => {
                error!(
                    "unknown bytecode {} at ip {:04x} in method {:04x}",
                    byte, self.instruction_pointer, self.method
                );
                Err(VmError::UnknownBytecode(byte))
            }
        }
    }

    fn temporary(&self, index: usize) -> Oop {
        self.memory
            .fetch_pointer(TEMP_FRAME_START + index, self.home_context)
    }

    fn store_temporary(&mut self, index: usize, value: Oop) {
        let home = self.home_context;
        self.memory
            .store_pointer(TEMP_FRAME_START + index, home, value);
    }

    fn special_constant(&self, index: u8) -> Oop {
        let wk = &self.memory.wk;
        match index {
            0 => self.receiver,
            1 => wk.true_oop,
            2 => wk.false_oop,
            3 => wk.nil,
            4 => wk.minus_one,
            5 => wk.zero,
            6 => wk.one,
            _ => wk.two,
        }
    }

    fn special_constant_for_return(&self, index: u8) -> Oop {
        let wk = &self.memory.wk;
        match index {
            0 => self.receiver,
            1 => wk.true_oop,
            2 => wk.false_oop,
            _ => wk.nil,
        }
    }

    fn extended_push(&mut self) -> Result<(), VmError> {
        let descriptor = self.next_byte();
        let index = (descriptor & 0x3F) as usize;
        let value = match descriptor >> 6 {
            0 => self.memory.fetch_pointer(index, self.receiver),
            1 => self.temporary(index),
            2 => self.literal(index, self.method),
            _ => {
                let association = self.literal(index, self.method);
                self.memory.fetch_pointer(VALUE_INDEX, association)
            }
        };
        self.push(value);
        Ok(())
    }

    fn extended_store(&mut self, pop_after: bool) -> Result<(), VmError> {
        let descriptor = self.next_byte();
        let index = (descriptor & 0x3F) as usize;
        let value = self.stack_top();
        match descriptor >> 6 {
            0 => {
                let receiver = self.receiver;
                self.memory.store_pointer(index, receiver, value);
            }
            1 => self.store_temporary(index, value),
            3 => {
                let association = self.literal(index, self.method);
                self.memory.store_pointer(VALUE_INDEX, association, value);
            }
            _ => {
                error!("extended store into a literal constant at ip {:04x}", self.instruction_pointer);
                return Err(VmError::UnknownBytecode(130));
            }
        }
        if pop_after {
            self.pop(1);
        }
        Ok(())
    }

    fn jump(&mut self, offset: isize) {
        self.instruction_pointer = (self.instruction_pointer as isize + offset) as usize;
    }

    /// Conditional jumps pop a boolean and branch when it matches `condition`; a
    /// non-boolean is put back and told mustBeBoolean.
    fn jump_unless(&mut self, offset: isize, condition: bool) -> Result<(), VmError> {
        let wk_true = self.memory.wk.true_oop;
        let wk_false = self.memory.wk.false_oop;
        let wanted = if condition { wk_true } else { wk_false };
        let skipped = if condition { wk_false } else { wk_true };
        let value = self.pop_stack();
        if value == wanted {
            self.jump(offset);
            Ok(())
        } else if value == skipped {
            Ok(())
        } else {
            self.send_must_be_boolean()
        }
    }

    /// Arithmetic special selectors take the primitive shortcut when both sides
    /// are small integers; otherwise they turn into ordinary sends of the paired
    /// selector from the SpecialSelectors table.
    fn send_arithmetic_selector(&mut self, index: u8) -> Result<(), VmError> {
        if self.dispatch_primitive(ARITHMETIC_PRIMITIVES[index as usize])? {
            return Ok(());
        }
        self.send_special_selector(index)
    }

    fn send_common_selector(&mut self, index: u8) -> Result<(), VmError> {
        // Identity and class never need a method: bytecodes 198 and 199.
        if index == 22 && self.dispatch_primitive(110)? {
            return Ok(());
        }
        if index == 23 && self.dispatch_primitive(111)? {
            return Ok(());
        }
        self.send_special_selector(index)
    }

    fn send_special_selector(&mut self, index: u8) -> Result<(), VmError> {
        let table = self.memory.wk.special_selectors;
        let selector = self.memory.fetch_pointer(2 * index as usize, table);
        let count = self
            .memory
            .integer_value_of(self.memory.fetch_pointer(2 * index as usize + 1, table))
            as usize;
        self.send_selector(selector, count)
    }

    /// Super sends start the lookup above the class that defines the running
    /// method, recorded in its last literal's association.
    fn send_super(&mut self, selector: Oop, count: usize) -> Result<(), VmError> {
        self.message_selector = selector;
        self.argument_count = count;
        let method = self.method;
        let association = self.literal(self.literal_count_of(method) - 1, method);
        let method_class = self.memory.fetch_pointer(VALUE_INDEX, association);
        let superclass = self.memory.fetch_pointer(SUPERCLASS_INDEX, method_class);
        self.send_selector_to_class(superclass)
    }
}
