// This is the place for the basic machine implementation: the bytecode loop, the
// context registers and the send/return machinery. The details of how bytecodes
// decode are implemented in the bytecodes module, primitive behavior lives in the
// primitives module, and process juggling in the scheduler module.

use crate::display::{DisplayHandle, HostMessage, NullDisk, VendorDisk};
use crate::memory::ObjectMemory;
use crate::oops::{Oop, UNUSED};
use crate::scheduler::{SwitchGovernor, ACTIVE_PROCESS_INDEX, SUSPENDED_CONTEXT_INDEX};
use crate::{Stats, VmError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

// Method context field layout.
pub const SENDER_INDEX: usize = 0;
pub const IP_INDEX: usize = 1;
pub const SP_INDEX: usize = 2;
pub const METHOD_INDEX: usize = 3;
pub const RECEIVER_INDEX: usize = 5;
pub const TEMP_FRAME_START: usize = 6;

// Block context fields; the first three alias the method context's. A context is
// a block context iff its method slot holds a small integer (the argument count).
pub const CALLER_INDEX: usize = 0;
pub const BLOCK_ARGUMENT_COUNT_INDEX: usize = 3;
pub const INITIAL_IP_INDEX: usize = 4;
pub const HOME_INDEX: usize = 5;

// Compiled method layout: header, literal frame, bytecodes.
pub const HEADER_INDEX: usize = 0;
pub const LITERAL_START: usize = 1;

// Class and message-dictionary layout.
pub const SUPERCLASS_INDEX: usize = 0;
pub const MESSAGE_DICTIONARY_INDEX: usize = 1;
pub const INSTANCE_SPECIFICATION_INDEX: usize = 2;
pub const METHOD_ARRAY_INDEX: usize = 1;
pub const SELECTOR_START: usize = 2;

// Message objects synthesized for doesNotUnderstand:.
pub const MESSAGE_SELECTOR_INDEX: usize = 0;
pub const MESSAGE_ARGUMENTS_INDEX: usize = 1;
pub const MESSAGE_SIZE: usize = 2;

// Associations (globals) and points.
pub const VALUE_INDEX: usize = 1;
pub const X_INDEX: usize = 0;
pub const Y_INDEX: usize = 1;
pub const POINT_SIZE: usize = 2;

const METHOD_CACHE_ENTRIES: usize = 256;

/// How many bytecodes may run between drains of the host-message queue.
const CHECK_INTERVAL: u32 = 100;

#[derive(Copy, Clone)]
struct CacheEntry {
    selector: Oop,
    class: Oop,
    method: Oop,
    primitive: u16,
}

impl CacheEntry {
    fn empty() -> Self {
        CacheEntry { selector: UNUSED, class: UNUSED, method: UNUSED, primitive: 0 }
    }
}

/// Everything the host side hands the interpreter at construction time.
pub struct Bridges {
    pub host_rx: Receiver<HostMessage>,
    pub host_tx: Sender<HostMessage>,
    pub display: DisplayHandle,
    pub disk: Box<dyn VendorDisk>,
    pub quit: Arc<AtomicBool>,
    pub stats: Arc<Stats>,
    pub tz_offset_minutes: i32,
    pub snapshot_path: PathBuf,
}

impl Bridges {
    /// Self-contained bridges with an internal channel pair; what the tests use,
    /// and what the front end starts from before swapping in the real window.
    pub fn loopback() -> Self {
        let (host_tx, host_rx) = unbounded();
        Bridges {
            host_rx,
            host_tx,
            display: DisplayHandle::new(),
            disk: Box::new(NullDisk),
            quit: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Stats::default()),
            tz_offset_minutes: 0,
            snapshot_path: PathBuf::from("snapshot.im"),
        }
    }
}

pub struct Interpreter {
    pub memory: ObjectMemory,
    // Context registers.
    pub active_context: Oop,
    pub home_context: Oop,
    pub method: Oop,
    pub receiver: Oop,
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
    // Message registers.
    pub message_selector: Oop,
    pub argument_count: usize,
    pub new_method: Oop,
    pub primitive_index: u16,
    // Process machinery.
    pub(crate) new_process: Option<Oop>,
    pub(crate) stalled: bool,
    pub(crate) throttle_pending: bool,
    switch_governor: SwitchGovernor,
    pub input_queue: VecDeque<u16>,
    pub input_semaphore: Oop,
    method_cache: Vec<CacheEntry>,
    check_countdown: u32,
    // Host bridges.
    pub(crate) host_rx: Receiver<HostMessage>,
    pub(crate) host_tx: Sender<HostMessage>,
    pub(crate) display: DisplayHandle,
    pub(crate) display_form: Oop,
    pub(crate) disk: Box<dyn VendorDisk>,
    pub(crate) quit_flag: Arc<AtomicBool>,
    pub stats: Arc<Stats>,
    pub(crate) snapshot_path: PathBuf,
    pub(crate) tz_offset_minutes: i32,
    // Tick timer.
    pub(crate) timer: timer::Timer,
    pub(crate) pending_tick: Option<timer::Guard>,
    pub(crate) tick_sequence: u64,
    pub(crate) tick_semaphore: Oop,
    pub(crate) start: Instant,
    // Low-space watcher, armed by a primitive.
    pub(crate) low_space_semaphore: Oop,
    pub(crate) low_space_words: usize,
    pub(crate) low_space_oops: usize,
}

impl Interpreter {
    pub fn new(memory: ObjectMemory, bridges: Bridges) -> Self {
        Interpreter {
            memory,
            active_context: UNUSED,
            home_context: UNUSED,
            method: UNUSED,
            receiver: UNUSED,
            instruction_pointer: 0,
            stack_pointer: 0,
            message_selector: UNUSED,
            argument_count: 0,
            new_method: UNUSED,
            primitive_index: 0,
            new_process: None,
            stalled: false,
            throttle_pending: false,
            switch_governor: SwitchGovernor::new(),
            input_queue: VecDeque::new(),
            input_semaphore: UNUSED,
            method_cache: vec![CacheEntry::empty(); METHOD_CACHE_ENTRIES],
            check_countdown: 0,
            host_rx: bridges.host_rx,
            host_tx: bridges.host_tx,
            display: bridges.display,
            display_form: UNUSED,
            disk: bridges.disk,
            quit_flag: bridges.quit,
            stats: bridges.stats,
            snapshot_path: bridges.snapshot_path,
            tz_offset_minutes: bridges.tz_offset_minutes,
            timer: timer::Timer::new(),
            pending_tick: None,
            tick_sequence: 0,
            tick_semaphore: UNUSED,
            start: Instant::now(),
            low_space_semaphore: UNUSED,
            low_space_words: 0,
            low_space_oops: 0,
        }
    }

    /// Picks up the suspended context of the image's active process and fills in
    /// the well-known pointers the image format leaves undeclared.
    pub fn boot(&mut self) -> Result<(), VmError> {
        let scheduler = self.scheduler_pointer();
        if !self.memory.has_object(scheduler) {
            return Err(VmError::CorruptImage("no processor scheduler".into()));
        }
        let process = self.memory.fetch_pointer(ACTIVE_PROCESS_INDEX, scheduler);
        if !self.memory.has_object(process) {
            return Err(VmError::CorruptImage("scheduler has no active process".into()));
        }
        let context = self.memory.fetch_pointer(SUSPENDED_CONTEXT_INDEX, process);
        if !self.memory.has_object(context) {
            return Err(VmError::CorruptImage("active process has no context".into()));
        }
        self.new_active_context(context);
        self.memory.wk.class_compiled_method = self.memory.fetch_class_of(self.method);
        self.memory.wk.class_symbol = self
            .memory
            .fetch_class_of(self.memory.wk.selector_does_not_understand);
        Ok(())
    }

    /// The driving loop: process-switch check, then one bytecode, until the quit
    /// condition surfaces.
    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            self.check_process_switch()?;
            self.step()?;
        }
    }

    pub fn step(&mut self) -> Result<(), VmError> {
        let byte = self.next_byte();
        self.stats.note_bytecode();
        self.dispatch_bytecode(byte)
    }

    // --- host message pump -------------------------------------------------

    /// The only suspension point: applied asynchronous signals, pending process
    /// transfers and the quit condition all take effect here, between bytecodes.
    pub fn check_process_switch(&mut self) -> Result<(), VmError> {
        if self.quit_flag.load(Ordering::Relaxed) {
            return Err(VmError::Quit);
        }
        if self.check_countdown == 0 {
            self.check_countdown = CHECK_INTERVAL;
            self.drain_host_messages()?;
            self.check_low_space();
        } else {
            self.check_countdown -= 1;
        }
        while self.stalled {
            // Nothing is runnable: block until a host signal readies a process.
            match self.host_rx.recv_timeout(std::time::Duration::from_millis(10)) {
                Ok(message) => self.apply_host_message(message)?,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(VmError::Quit)
                }
            }
            if self.quit_flag.load(Ordering::Relaxed) {
                return Err(VmError::Quit);
            }
        }
        if let Some(process) = self.new_process.take() {
            self.switch_active_process(process);
        }
        if self.throttle_pending {
            // Cooperative yield with nothing else ready: doze briefly instead of
            // spinning, but wake as soon as the host has something for us.
            self.throttle_pending = false;
            if let Ok(message) =
                self.host_rx.recv_timeout(std::time::Duration::from_millis(10))
            {
                self.apply_host_message(message)?;
            }
        }
        Ok(())
    }

    pub(crate) fn drain_host_messages(&mut self) -> Result<(), VmError> {
        while let Ok(message) = self.host_rx.try_recv() {
            self.apply_host_message(message)?;
        }
        Ok(())
    }

    pub(crate) fn apply_host_message(&mut self, message: HostMessage) -> Result<(), VmError> {
        match message {
            HostMessage::Event(word) => {
                self.input_queue.push_back(word);
                let semaphore = self.input_semaphore;
                if self.memory.has_object(semaphore) {
                    self.synchronous_signal(semaphore);
                }
            }
            HostMessage::TickFired(sequence) => {
                if sequence == self.tick_sequence && self.memory.has_object(self.tick_semaphore) {
                    let semaphore = self.tick_semaphore;
                    self.tick_semaphore = UNUSED;
                    self.pending_tick = None;
                    self.synchronous_signal(semaphore);
                }
            }
            HostMessage::Quit => return Err(VmError::Quit),
        }
        Ok(())
    }

    fn switch_active_process(&mut self, process: Oop) {
        self.store_context_registers();
        let scheduler = self.scheduler_pointer();
        let outgoing = self.memory.fetch_pointer(ACTIVE_PROCESS_INDEX, scheduler);
        self.memory
            .store_pointer(SUSPENDED_CONTEXT_INDEX, outgoing, self.active_context);
        self.memory.store_pointer(ACTIVE_PROCESS_INDEX, scheduler, process);
        self.release_transfer_hold(process);
        let context = self.memory.fetch_pointer(SUSPENDED_CONTEXT_INDEX, process);
        self.new_active_context(context);
        self.stats.note_process_switch();
        if self.switch_governor.note_switch() {
            self.throttle_pending = true;
        }
    }

    fn check_low_space(&mut self) {
        if !self.memory.has_object(self.low_space_semaphore) {
            return;
        }
        if self.memory.free_heap_words() < self.low_space_words
            || self.memory.free_table_slots() < self.low_space_oops
        {
            let semaphore = self.low_space_semaphore;
            self.low_space_semaphore = UNUSED;
            self.synchronous_signal(semaphore);
        }
    }

    pub fn millisecond_clock(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    // --- garbage collection glue -------------------------------------------

    pub(crate) fn gc_roots(&self) -> Vec<Oop> {
        let mut roots = vec![
            self.active_context,
            self.home_context,
            self.method,
            self.receiver,
            self.message_selector,
            self.new_method,
            self.input_semaphore,
            self.tick_semaphore,
            self.low_space_semaphore,
            self.display_form,
        ];
        if let Some(process) = self.new_process {
            roots.push(process);
        }
        roots
    }

    pub fn collect_garbage(&mut self) {
        self.store_context_registers();
        let roots = self.gc_roots();
        self.memory.collect_garbage(&roots);
        // Purging may have taken selectors with it.
        self.flush_method_cache();
    }

    /// Allocation wrappers: collect on heap pressure first, and once more on a
    /// hard failure before declaring the image out of memory.
    pub(crate) fn instantiate_pointers(&mut self, class: Oop, length: usize) -> Result<Oop, VmError> {
        if self.memory.gc_advised(length) {
            self.collect_garbage();
        }
        match self.memory.instantiate_class_with_pointers(class, length) {
            Ok(oop) => Ok(oop),
            Err(_) => {
                self.collect_garbage();
                self.memory.instantiate_class_with_pointers(class, length)
            }
        }
    }

    pub(crate) fn instantiate_words(&mut self, class: Oop, length: usize) -> Result<Oop, VmError> {
        if self.memory.gc_advised(length) {
            self.collect_garbage();
        }
        match self.memory.instantiate_class_with_words(class, length) {
            Ok(oop) => Ok(oop),
            Err(_) => {
                self.collect_garbage();
                self.memory.instantiate_class_with_words(class, length)
            }
        }
    }

    pub(crate) fn instantiate_bytes(&mut self, class: Oop, length: usize) -> Result<Oop, VmError> {
        if self.memory.gc_advised(length / 2) {
            self.collect_garbage();
        }
        match self.memory.instantiate_class_with_bytes(class, length) {
            Ok(oop) => Ok(oop),
            Err(_) => {
                self.collect_garbage();
                self.memory.instantiate_class_with_bytes(class, length)
            }
        }
    }

    // --- context registers and the stack ------------------------------------

    pub(crate) fn scheduler_pointer(&self) -> Oop {
        self.memory
            .fetch_pointer(VALUE_INDEX, self.memory.wk.scheduler_association)
    }

    pub fn is_block_context(&self, context: Oop) -> bool {
        self.memory
            .is_integer_object(self.memory.fetch_pointer(METHOD_INDEX, context))
    }

    pub(crate) fn fetch_context_registers(&mut self) {
        let active = self.active_context;
        self.home_context = if self.is_block_context(active) {
            self.memory.fetch_pointer(HOME_INDEX, active)
        } else {
            active
        };
        self.receiver = self.memory.fetch_pointer(RECEIVER_INDEX, self.home_context);
        self.method = self.memory.fetch_pointer(METHOD_INDEX, self.home_context);
        let ip = self.memory.fetch_pointer(IP_INDEX, active);
        self.instruction_pointer = self.memory.integer_value_of(ip) as usize - 1;
        let sp = self.memory.fetch_pointer(SP_INDEX, active);
        self.stack_pointer = self.memory.integer_value_of(sp) as usize + TEMP_FRAME_START - 1;
    }

    pub(crate) fn store_context_registers(&mut self) {
        if self.active_context == UNUSED {
            return;
        }
        let ip = self.memory.integer_object_of(self.instruction_pointer as i16 + 1);
        let sp = self
            .memory
            .integer_object_of((self.stack_pointer + 1 - TEMP_FRAME_START) as i16);
        let active = self.active_context;
        self.memory.store_pointer(IP_INDEX, active, ip);
        self.memory.store_pointer(SP_INDEX, active, sp);
    }

    /// Switches the active-context register, which owns one reference count.
    pub fn new_active_context(&mut self, context: Oop) {
        self.store_context_registers();
        self.memory.increment_count(context);
        if self.active_context != UNUSED {
            self.memory.decrement_count(self.active_context);
        }
        self.active_context = context;
        self.fetch_context_registers();
    }

    pub(crate) fn push(&mut self, value: Oop) {
        self.stack_pointer += 1;
        let context = self.active_context;
        self.memory.store_pointer(self.stack_pointer, context, value);
    }

    pub(crate) fn pop_stack(&mut self) -> Oop {
        let value = self.memory.fetch_pointer(self.stack_pointer, self.active_context);
        self.stack_pointer -= 1;
        value
    }

    pub(crate) fn stack_top(&self) -> Oop {
        self.memory.fetch_pointer(self.stack_pointer, self.active_context)
    }

    pub(crate) fn stack_value(&self, depth: usize) -> Oop {
        self.memory
            .fetch_pointer(self.stack_pointer - depth, self.active_context)
    }

    pub(crate) fn pop(&mut self, count: usize) {
        self.stack_pointer -= count;
    }

    pub(crate) fn unpop(&mut self, count: usize) {
        self.stack_pointer += count;
    }

    // --- method access ------------------------------------------------------

    pub(crate) fn next_byte(&mut self) -> u8 {
        let byte = self.memory.fetch_byte(self.instruction_pointer, self.method);
        self.instruction_pointer += 1;
        byte
    }

    pub(crate) fn header_value_of(&self, method: Oop) -> u16 {
        let header = self.memory.fetch_pointer(HEADER_INDEX, method);
        self.memory.integer_value_of(header) as u16
    }

    pub(crate) fn literal_count_of(&self, method: Oop) -> usize {
        self.memory.tagging.literal_count_of(self.header_value_of(method))
    }

    pub(crate) fn literal(&self, index: usize, method: Oop) -> Oop {
        self.memory.fetch_pointer(LITERAL_START + index, method)
    }

    pub(crate) fn temporary_count_of(&self, method: Oop) -> usize {
        self.memory.tagging.temporary_count_of(self.header_value_of(method))
    }

    pub(crate) fn flag_value_of(&self, method: Oop) -> usize {
        self.memory.tagging.flag_value_of(self.header_value_of(method))
    }

    pub(crate) fn large_context_flag_of(&self, method: Oop) -> bool {
        self.memory.tagging.large_context_flag_of(self.header_value_of(method))
    }

    fn header_extension_of(&self, method: Oop) -> u16 {
        let literal = self.literal(self.literal_count_of(method) - 2, method);
        self.memory.integer_value_of(literal) as u16
    }

    pub(crate) fn primitive_index_of(&self, method: Oop) -> u16 {
        if self.flag_value_of(method) == 7 {
            self.memory
                .tagging
                .primitive_index_of_extension(self.header_extension_of(method))
        } else {
            0
        }
    }

    pub(crate) fn initial_instruction_pointer_of(&self, method: Oop) -> usize {
        (self.literal_count_of(method) + 1) * 2
    }

    pub(crate) fn field_index_of(&self, method: Oop) -> usize {
        self.memory.tagging.field_index_of(self.header_value_of(method))
    }

    // --- sending ------------------------------------------------------------

    pub(crate) fn send_selector(&mut self, selector: Oop, argument_count: usize) -> Result<(), VmError> {
        self.message_selector = selector;
        self.argument_count = argument_count;
        let receiver = self.stack_value(argument_count);
        let class = self.memory.fetch_class_of(receiver);
        self.send_selector_to_class(class)
    }

    pub(crate) fn send_selector_to_class(&mut self, class: Oop) -> Result<(), VmError> {
        self.stats.note_send();
        if !self.lookup_method_in_cache(class) {
            self.lookup_method_in_class(class)?;
            let slot = Self::cache_slot(self.message_selector, class);
            self.method_cache[slot] = CacheEntry {
                selector: self.message_selector,
                class,
                method: self.new_method,
                primitive: self.primitive_index,
            };
        }
        self.execute_new_method()
    }

    fn cache_slot(selector: Oop, class: Oop) -> usize {
        (((selector ^ class) & 0x01FE) >> 1) as usize
    }

    fn lookup_method_in_cache(&mut self, class: Oop) -> bool {
        let entry = &self.method_cache[Self::cache_slot(self.message_selector, class)];
        if entry.selector == self.message_selector && entry.class == class {
            self.new_method = entry.method;
            self.primitive_index = entry.primitive;
            return true;
        }
        false
    }

    pub(crate) fn flush_method_cache(&mut self) {
        for entry in &mut self.method_cache {
            *entry = CacheEntry::empty();
        }
    }

    /// Walks the superclass chain; a miss synthesizes a Message and restarts as
    /// doesNotUnderstand:, whose own absence is unrecoverable.
    fn lookup_method_in_class(&mut self, class: Oop) -> Result<(), VmError> {
        let nil = self.memory.wk.nil;
        let mut current = class;
        while current != nil {
            if !self.memory.has_object(current) {
                error!(
                    "corrupt superclass chain at {:04x} while sending {:04x}",
                    current, self.message_selector
                );
                return Err(VmError::CorruptImage(format!(
                    "superclass chain reaches non-object {:04x}",
                    current
                )));
            }
            let dictionary = self.memory.fetch_pointer(MESSAGE_DICTIONARY_INDEX, current);
            if let Some(method) = self.lookup_method_in_dictionary(dictionary) {
                self.new_method = method;
                self.primitive_index = self.primitive_index_of(method);
                return Ok(());
            }
            current = self.memory.fetch_pointer(SUPERCLASS_INDEX, current);
        }
        if self.message_selector == self.memory.wk.selector_does_not_understand {
            error!(
                "recursive doesNotUnderstand: in class {:04x}, ip {:04x}",
                class, self.instruction_pointer
            );
            return Err(VmError::RecursiveDoesNotUnderstand);
        }
        self.create_actual_message()?;
        self.message_selector = self.memory.wk.selector_does_not_understand;
        self.lookup_method_in_class(class)
    }

    fn lookup_method_in_dictionary(&self, dictionary: Oop) -> Option<Oop> {
        if !self.memory.has_object(dictionary) {
            return None;
        }
        let nil = self.memory.wk.nil;
        let length = self.memory.word_length_of(dictionary);
        if length <= SELECTOR_START {
            return None;
        }
        let slots = length - SELECTOR_START;
        let hash = self.memory.tagging.linear_of(self.message_selector);
        let mut index = SELECTOR_START + hash % slots;
        for _ in 0..slots {
            let probed = self.memory.fetch_pointer(index, dictionary);
            if probed == nil {
                return None;
            }
            if probed == self.message_selector {
                let methods = self.memory.fetch_pointer(METHOD_ARRAY_INDEX, dictionary);
                return Some(self.memory.fetch_pointer(index - SELECTOR_START, methods));
            }
            index += 1;
            if index == length {
                index = SELECTOR_START;
            }
        }
        None
    }

    /// Bundles the failed selector and its arguments into a Message object left
    /// on the stack as the single argument of the retry.
    fn create_actual_message(&mut self) -> Result<(), VmError> {
        let argument_count = self.argument_count;
        let array_class = self.memory.wk.class_array;
        let message_class = self.memory.wk.class_message;
        let arguments = self.instantiate_pointers(array_class, argument_count)?;
        for index in 0..argument_count {
            let value = self.stack_value(argument_count - 1 - index);
            self.memory.store_pointer(index, arguments, value);
        }
        let message = self.instantiate_pointers(message_class, MESSAGE_SIZE)?;
        let selector = self.message_selector;
        self.memory
            .store_pointer(MESSAGE_SELECTOR_INDEX, message, selector);
        self.memory
            .store_pointer(MESSAGE_ARGUMENTS_INDEX, message, arguments);
        self.memory.release_in_hand(arguments);
        self.pop(argument_count);
        self.push(message);
        self.memory.release_in_hand(message);
        self.argument_count = 1;
        Ok(())
    }

    fn execute_new_method(&mut self) -> Result<(), VmError> {
        if !self.try_primitive()? {
            self.activate_new_method()?;
        }
        Ok(())
    }

    fn try_primitive(&mut self) -> Result<bool, VmError> {
        match self.flag_value_of(self.new_method) {
            5 => Ok(true), // quick self return: the receiver already tops the stack
            6 => {
                let index = self.field_index_of(self.new_method);
                let receiver = self.pop_stack();
                let value = self.memory.fetch_pointer(index, receiver);
                self.push(value);
                Ok(true)
            }
            7 if self.primitive_index != 0 => {
                self.stats.note_primitive();
                self.dispatch_primitive(self.primitive_index)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn activate_new_method(&mut self) -> Result<(), VmError> {
        let method = self.new_method;
        let size =
            TEMP_FRAME_START + if self.large_context_flag_of(method) { 32 } else { 12 };
        let class = self.memory.wk.class_method_context;
        let context = self.instantiate_pointers(class, size)?;
        let active = self.active_context;
        self.memory.store_pointer(SENDER_INDEX, context, active);
        let initial_ip = self
            .memory
            .integer_object_of(self.initial_instruction_pointer_of(method) as i16 + 1);
        self.memory.store_pointer(IP_INDEX, context, initial_ip);
        let stored_sp = self
            .memory
            .integer_object_of(self.temporary_count_of(method) as i16);
        self.memory.store_pointer(SP_INDEX, context, stored_sp);
        self.memory.store_pointer(METHOD_INDEX, context, method);
        // Receiver and arguments move from the caller's stack into the fixed
        // frame slots of the fresh context.
        let argument_count = self.argument_count;
        for index in 0..=argument_count {
            let value = self.stack_value(argument_count - index);
            self.memory
                .store_pointer(RECEIVER_INDEX + index, context, value);
        }
        self.pop(argument_count + 1);
        self.new_active_context(context);
        self.memory.release_in_hand(context);
        Ok(())
    }

    // --- returning ----------------------------------------------------------

    /// The sender of the home context: where `^expr` goes.
    pub(crate) fn home_sender(&self) -> Oop {
        self.memory.fetch_pointer(SENDER_INDEX, self.home_context)
    }

    pub(crate) fn caller(&self) -> Oop {
        self.memory.fetch_pointer(CALLER_INDEX, self.active_context)
    }

    pub(crate) fn return_value(&mut self, result: Oop, target: Oop) -> Result<(), VmError> {
        let nil = self.memory.wk.nil;
        if target == nil || self.memory.fetch_pointer(IP_INDEX, target) == nil {
            return self.send_cannot_return(result);
        }
        self.memory.increment_count(result);
        // Deactivate: the dying context drops its sender and instruction pointer,
        // then its register reference, which usually frees it for reuse.
        self.memory.increment_count(target);
        let active = self.active_context;
        self.memory.store_pointer(SENDER_INDEX, active, nil);
        self.memory.store_pointer(IP_INDEX, active, nil);
        self.memory.decrement_count(active);
        self.active_context = target;
        self.fetch_context_registers();
        self.push(result);
        self.memory.decrement_count(result);
        Ok(())
    }

    fn send_cannot_return(&mut self, result: Oop) -> Result<(), VmError> {
        warn!(
            "return into a dead context from {:04x}, ip {:04x}",
            self.active_context, self.instruction_pointer
        );
        let active = self.active_context;
        self.push(active);
        self.push(result);
        let selector = self.memory.wk.selector_cannot_return;
        self.send_selector(selector, 1)
    }

    pub(crate) fn send_must_be_boolean(&mut self) -> Result<(), VmError> {
        self.unpop(1);
        let selector = self.memory.wk.selector_must_be_boolean;
        self.send_selector(selector, 0)
    }
}
