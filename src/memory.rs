// The object memory: a dual-indexed object table in front of two equal heap arenas.
// Object pointers are the stable identities; heap addresses are fluid and get
// rewritten wholesale when the mark-sweep pass compacts live objects into the
// companion arena. Reference counts are maintained eagerly on pointer stores but
// the collector re-derives them during marking, so they are a reclamation hint,
// not ground truth.

use crate::oops::{Oop, Tagging, WellKnown, HEADER_WORDS, UNUSED};
use crate::VmError;
use log::{debug, error};

/// Words per heap arena. Two arenas of this size swap roles on compaction.
pub const HEAP_WORDS: usize = 1 << 20;

/// Largest chunk size (in words, headers included) kept on a per-size free list.
/// Bigger chunks are only reclaimed by compaction.
pub const BIG_SIZE: usize = 256;

/// A reference count of 127 pins the object permanently.
pub const PINNED: u8 = 127;

/// Heap pressure threshold: allocations are preceded by a collection once the
/// active arena fills past this mark.
const SOFT_LIMIT: usize = HEAP_WORDS - (HEAP_WORDS >> 4);

#[derive(Debug, Clone)]
pub struct OtEntry {
    pub count: u8,
    pub odd_length: bool,
    pub pointer_fields: bool,
    pub free: bool,
    pub segment: u8,
    pub location: u16,
    /// Mirror of the heap size word, kept for length queries without chasing the
    /// heap address.
    pub size: u16,
    /// Generation number of the last marking pass that reached this object.
    pub mark: u32,
}

impl OtEntry {
    pub fn free_entry() -> Self {
        OtEntry {
            count: 0,
            odd_length: false,
            pointer_fields: false,
            free: true,
            segment: 0,
            location: 0,
            size: 0,
            mark: 0,
        }
    }

    pub fn address(&self) -> usize {
        ((self.segment as usize) << 16) | self.location as usize
    }

    pub fn set_address(&mut self, address: usize) {
        self.segment = ((address >> 16) & 0x0F) as u8;
        self.location = (address & 0xFFFF) as u16;
    }
}

pub struct ObjectMemory {
    pub tagging: Tagging,
    pub wk: WellKnown,
    pub(crate) ot: Vec<OtEntry>,
    pub(crate) heaps: [Vec<u16>; 2],
    pub(crate) active_heap: usize,
    pub(crate) heap_used: usize,
    pub(crate) used_slots: usize,
    free_lists: Vec<Oop>,
    free_slot_hint: usize,
    generation: u32,
    free_suspended: u32,
    deferred: Vec<Oop>,
    releasing: bool,
    release_queue: Vec<Oop>,
    purge_dictionaries: Vec<Oop>,
    in_hand: Vec<Oop>,
    pub gc_count: u64,
}

impl ObjectMemory {
    pub fn new(tagging: Tagging) -> Self {
        let slots = tagging.object_slots();
        ObjectMemory {
            tagging,
            wk: tagging.well_known(),
            ot: vec![OtEntry::free_entry(); slots],
            heaps: [vec![0; HEAP_WORDS], vec![0; HEAP_WORDS]],
            active_heap: 0,
            heap_used: 0,
            used_slots: 0,
            free_lists: vec![UNUSED; BIG_SIZE + 1],
            free_slot_hint: 1,
            generation: 0,
            free_suspended: 0,
            deferred: Vec::new(),
            releasing: false,
            release_queue: Vec::new(),
            purge_dictionaries: Vec::new(),
            in_hand: Vec::new(),
            gc_count: 0,
        }
    }

    // --- tagged integer conversions ---------------------------------------

    pub fn is_integer_object(&self, oop: Oop) -> bool {
        self.tagging.is_integer_object(oop)
    }

    pub fn integer_value_of(&self, oop: Oop) -> i16 {
        self.tagging.integer_value_of(oop)
    }

    pub fn integer_object_of(&self, value: i16) -> Oop {
        self.tagging.integer_object_of(value)
    }

    pub fn is_integer_value(&self, value: i32) -> bool {
        self.tagging.is_integer_value(value)
    }

    // --- raw field access --------------------------------------------------

    pub(crate) fn entry(&self, oop: Oop) -> &OtEntry {
        &self.ot[self.tagging.linear_of(oop)]
    }

    pub(crate) fn entry_mut(&mut self, oop: Oop) -> &mut OtEntry {
        let linear = self.tagging.linear_of(oop);
        &mut self.ot[linear]
    }

    pub fn has_object(&self, oop: Oop) -> bool {
        if oop == UNUSED || self.is_integer_object(oop) {
            return false;
        }
        let linear = self.tagging.linear_of(oop);
        linear < self.used_slots && !self.ot[linear].free
    }

    fn field_address(&self, oop: Oop) -> usize {
        self.entry(oop).address() + HEADER_WORDS
    }

    pub fn fetch_word(&self, index: usize, oop: Oop) -> u16 {
        self.heaps[self.active_heap][self.field_address(oop) + index]
    }

    pub fn store_word(&mut self, index: usize, oop: Oop, value: u16) {
        let address = self.field_address(oop) + index;
        self.heaps[self.active_heap][address] = value;
    }

    /// Bytes live big-endian within their word, matching the image file layout.
    pub fn fetch_byte(&self, index: usize, oop: Oop) -> u8 {
        let word = self.fetch_word(index / 2, oop);
        if index & 1 == 0 {
            (word >> 8) as u8
        } else {
            (word & 0xFF) as u8
        }
    }

    pub fn store_byte(&mut self, index: usize, oop: Oop, value: u8) {
        let word = self.fetch_word(index / 2, oop);
        let word = if index & 1 == 0 {
            (word & 0x00FF) | ((value as u16) << 8)
        } else {
            (word & 0xFF00) | value as u16
        };
        self.store_word(index / 2, oop, word);
    }

    pub fn fetch_pointer(&self, index: usize, oop: Oop) -> Oop {
        self.fetch_word(index, oop)
    }

    /// The counted store: the incoming value gains a reference, the displaced
    /// field contents lose one. Small integers and nil are never counted.
    pub fn store_pointer(&mut self, index: usize, oop: Oop, value: Oop) {
        self.increment_count(value);
        let prior = self.fetch_word(index, oop);
        self.decrement_count(prior);
        self.store_word(index, oop, value);
    }

    // --- reference counting ------------------------------------------------

    fn counted(&self, oop: Oop) -> bool {
        oop != UNUSED && oop != self.wk.nil && !self.is_integer_object(oop)
    }

    pub fn increment_count(&mut self, oop: Oop) {
        if !self.counted(oop) {
            return;
        }
        let entry = self.entry_mut(oop);
        if entry.count < PINNED {
            entry.count += 1;
        }
    }

    pub fn decrement_count(&mut self, oop: Oop) {
        if !self.counted(oop) {
            return;
        }
        let entry = self.entry_mut(oop);
        if entry.count == PINNED {
            return;
        }
        if entry.count == 0 {
            error!("reference count underflow on oop {:04x}", oop);
            panic!("reference count underflow on oop {:04x}", oop);
        }
        entry.count -= 1;
        if entry.count == 0 {
            self.release(oop);
        }
    }

    /// Drops the allocation-time reference once the new object is anchored in a
    /// counted slot (or in the active-context register). Until then the object
    /// is a collection root, so an allocation-triggered collection cannot eat a
    /// value still sitting in host variables.
    pub fn release_in_hand(&mut self, oop: Oop) {
        if let Some(position) = self.in_hand.iter().position(|&held| held == oop) {
            self.in_hand.swap_remove(position);
        }
        self.decrement_count(oop);
    }

    /// While suspended, objects whose count reaches zero are queued instead of
    /// freed. Scheduler list surgery relies on this to keep transiently detached
    /// link nodes alive; the discipline is reentrant.
    pub fn suspend_freeing(&mut self) {
        self.free_suspended += 1;
    }

    pub fn resume_freeing(&mut self) {
        debug_assert!(self.free_suspended > 0);
        self.free_suspended -= 1;
        if self.free_suspended == 0 && !self.deferred.is_empty() {
            let deferred = std::mem::take(&mut self.deferred);
            for oop in deferred {
                // A node re-linked during the suspension has a count again and
                // must survive.
                if self.has_object(oop) && self.entry(oop).count == 0 {
                    self.release(oop);
                }
            }
        }
    }

    fn release(&mut self, oop: Oop) {
        if self.free_suspended > 0 {
            self.deferred.push(oop);
            return;
        }
        self.release_queue.push(oop);
        if self.releasing {
            return;
        }
        self.releasing = true;
        while let Some(oop) = self.release_queue.pop() {
            self.release_one(oop);
        }
        self.releasing = false;
    }

    /// Count reached zero: let go of everything this object references, then
    /// recycle its table entry and heap chunk.
    fn release_one(&mut self, oop: Oop) {
        let entry = self.entry(oop).clone();
        let class = self.heaps[self.active_heap][entry.address() + 1];
        if entry.pointer_fields {
            let fields = entry.size as usize - HEADER_WORDS;
            for index in 0..fields {
                let held = self.fetch_pointer(index, oop);
                self.decrement_count(held);
            }
        } else if class != UNUSED && class == self.wk.class_compiled_method {
            let header = self.fetch_pointer(0, oop);
            let literals = self.tagging.literal_count_of(self.integer_value_of(header) as u16);
            for index in 1..=literals {
                let held = self.fetch_pointer(index, oop);
                self.decrement_count(held);
            }
        }
        self.decrement_count(class);
        self.free_chunk(oop);
    }

    fn free_chunk(&mut self, oop: Oop) {
        let linear = self.tagging.linear_of(oop);
        let size = self.ot[linear].size as usize;
        if size <= BIG_SIZE {
            // Chain through the class slot; the entry stays formally in use
            // (free flag off, count zero) until reallocated or collected.
            let address = self.ot[linear].address();
            self.heaps[self.active_heap][address + 1] = self.free_lists[size];
            self.free_lists[size] = oop;
            self.ot[linear].count = 0;
        } else {
            self.ot[linear].free = true;
            self.free_slot_hint = self.free_slot_hint.min(linear);
        }
    }

    // --- allocation --------------------------------------------------------

    /// True when the next allocation of `upcoming` words should be preceded by a
    /// collection. The caller owns the roots, so the collection itself happens a
    /// level up.
    pub fn gc_advised(&self, upcoming: usize) -> bool {
        self.heap_used + upcoming + HEADER_WORDS >= SOFT_LIMIT
    }

    fn take_table_slot(&mut self) -> Result<usize, VmError> {
        let mut linear = self.free_slot_hint.max(1);
        while linear < self.used_slots {
            if self.ot[linear].free {
                self.free_slot_hint = linear + 1;
                return Ok(linear);
            }
            linear += 1;
        }
        if self.used_slots < self.tagging.object_slots() {
            if self.used_slots == 0 {
                self.used_slots = 1;
            }
            let slot = self.used_slots;
            self.used_slots += 1;
            self.free_slot_hint = self.used_slots;
            return Ok(slot);
        }
        Err(VmError::OutOfObjectTable)
    }

    /// Core allocator. `total_words` includes the two header words. The returned
    /// object carries one in-hand reference; callers anchor it and then call
    /// `release_in_hand`, or hand it to the active-context register.
    pub fn allocate(
        &mut self,
        total_words: usize,
        class: Oop,
        pointer_fields: bool,
        odd_length: bool,
    ) -> Result<Oop, VmError> {
        debug_assert!(total_words >= HEADER_WORDS && total_words <= 0xFFFF);
        if total_words <= BIG_SIZE && self.free_lists[total_words] != UNUSED {
            let oop = self.free_lists[total_words];
            let address = self.entry(oop).address();
            self.free_lists[total_words] = self.heaps[self.active_heap][address + 1];
            self.increment_count(class);
            self.heaps[self.active_heap][address + 1] = class;
            let entry = self.entry_mut(oop);
            entry.count = 1;
            entry.pointer_fields = pointer_fields;
            entry.odd_length = odd_length;
            self.in_hand.push(oop);
            self.init_fields(oop, total_words, pointer_fields);
            return Ok(oop);
        }
        if self.heap_used + total_words > HEAP_WORDS {
            return Err(VmError::OutOfHeap);
        }
        let linear = self.take_table_slot()?;
        let address = self.heap_used;
        self.heap_used += total_words;
        let oop = self.tagging.oop_of_linear(linear);
        self.increment_count(class);
        self.heaps[self.active_heap][address] = total_words as u16;
        self.heaps[self.active_heap][address + 1] = class;
        let entry = &mut self.ot[linear];
        entry.free = false;
        entry.count = 1;
        entry.pointer_fields = pointer_fields;
        entry.odd_length = odd_length;
        entry.size = total_words as u16;
        entry.mark = 0;
        entry.set_address(address);
        self.in_hand.push(oop);
        self.init_fields(oop, total_words, pointer_fields);
        Ok(oop)
    }

    fn init_fields(&mut self, oop: Oop, total_words: usize, pointer_fields: bool) {
        let fill = if pointer_fields { self.wk.nil } else { 0 };
        let address = self.field_address(oop);
        for word in &mut self.heaps[self.active_heap][address..address + total_words - HEADER_WORDS]
        {
            *word = fill;
        }
    }

    pub fn instantiate_class_with_pointers(
        &mut self,
        class: Oop,
        length: usize,
    ) -> Result<Oop, VmError> {
        self.allocate(length + HEADER_WORDS, class, true, false)
    }

    pub fn instantiate_class_with_words(
        &mut self,
        class: Oop,
        length: usize,
    ) -> Result<Oop, VmError> {
        self.allocate(length + HEADER_WORDS, class, false, false)
    }

    pub fn instantiate_class_with_bytes(
        &mut self,
        class: Oop,
        length: usize,
    ) -> Result<Oop, VmError> {
        self.allocate((length + 1) / 2 + HEADER_WORDS, class, false, length & 1 == 1)
    }

    // --- object queries ----------------------------------------------------

    pub fn fetch_class_of(&self, oop: Oop) -> Oop {
        if self.is_integer_object(oop) {
            return self.wk.class_small_integer;
        }
        self.heaps[self.active_heap][self.entry(oop).address() + 1]
    }

    pub fn word_length_of(&self, oop: Oop) -> usize {
        self.entry(oop).size as usize - HEADER_WORDS
    }

    pub fn byte_length_of(&self, oop: Oop) -> usize {
        let entry = self.entry(oop);
        let words = entry.size as usize - HEADER_WORDS;
        words * 2 - entry.odd_length as usize
    }

    pub fn pointer_fields_of(&self, oop: Oop) -> bool {
        self.entry(oop).pointer_fields
    }

    pub fn count_of(&self, oop: Oop) -> u8 {
        self.entry(oop).count
    }

    /// First instance of `class` in linear table order, or nil.
    pub fn initial_instance_of(&self, class: Oop) -> Oop {
        self.instance_from(1, class)
    }

    /// Next instance of `oop`'s class after it in linear order, or nil.
    pub fn instance_after(&self, oop: Oop) -> Oop {
        let class = self.fetch_class_of(oop);
        self.instance_from(self.tagging.linear_of(oop) + 1, class)
    }

    fn instance_from(&self, start: usize, class: Oop) -> Oop {
        for linear in start..self.used_slots {
            let entry = &self.ot[linear];
            if entry.free {
                continue;
            }
            // Free-list residents have a zero count and stale contents.
            if entry.count == 0 {
                continue;
            }
            if self.heaps[self.active_heap][entry.address() + 1] == class {
                return self.tagging.oop_of_linear(linear);
            }
        }
        self.wk.nil
    }

    /// The become: operation: the two pointers exchange underlying objects while
    /// each keeps its own reference count, so every third-party slot naming `a`
    /// now reaches `b`'s storage and vice versa.
    pub fn swap_pointers_of(&mut self, a: Oop, b: Oop) {
        let la = self.tagging.linear_of(a);
        let lb = self.tagging.linear_of(b);
        let count_a = self.ot[la].count;
        let count_b = self.ot[lb].count;
        self.ot.swap(la, lb);
        self.ot[la].count = count_a;
        self.ot[lb].count = count_b;
    }

    // --- garbage collection ------------------------------------------------

    /// Registers an identity dictionary (value array in field 1, keys from field
    /// 2 on) whose singly-referenced keys may be purged during collection.
    pub fn register_purge_dictionary(&mut self, dictionary: Oop) {
        if !self.purge_dictionaries.contains(&dictionary) {
            self.purge_dictionaries.push(dictionary);
        }
    }

    pub fn free_table_slots(&self) -> usize {
        self.tagging.object_slots() - self.used_slots
            + (1..self.used_slots).filter(|&l| self.ot[l].free).count()
    }

    pub fn free_heap_words(&self) -> usize {
        HEAP_WORDS - self.heap_used
    }

    /// Mark-sweep-compact. Marking starts from the well-known table plus
    /// `extra_roots` (interpreter registers, pending host semaphores) and
    /// re-derives every reference count; unmarked objects are swept without
    /// recursion, and the survivors are copied densely into the companion arena,
    /// which then becomes the active one.
    pub fn collect_garbage(&mut self, extra_roots: &[Oop]) {
        let before = self.heap_used;
        self.drop_free_lists();
        let purged = self.prepare_purge();
        self.generation = self.generation.wrapping_add(1);

        let mut counts = vec![0u32; self.used_slots];
        let mut stack: Vec<Oop> = Vec::with_capacity(256);
        let roots: Vec<Oop> = self
            .wk
            .roots()
            .into_iter()
            .chain(extra_roots.iter().copied())
            .chain(self.in_hand.clone())
            .collect();
        for root in roots {
            self.mark_from(root, &mut counts, &mut stack);
        }
        self.resolve_purge(purged);

        // Anything the marker never reached is garbage; its outgoing references
        // are unreachable too and get swept in this same pass.
        for linear in 1..self.used_slots {
            let entry = &mut self.ot[linear];
            if entry.free {
                continue;
            }
            if entry.mark != self.generation {
                entry.free = true;
                entry.count = 0;
            } else if entry.count != PINNED {
                entry.count = counts[linear].min(PINNED as u32) as u8;
            }
        }
        self.deferred.clear();

        self.compact();
        self.gc_count += 1;
        debug!(
            "GC #{}: heap {} -> {} words, {} table slots free",
            self.gc_count,
            before,
            self.heap_used,
            self.free_table_slots()
        );
    }

    fn drop_free_lists(&mut self) {
        for size in 0..=BIG_SIZE {
            let mut oop = self.free_lists[size];
            while oop != UNUSED {
                let address = self.entry(oop).address();
                let next = self.heaps[self.active_heap][address + 1];
                let linear = self.tagging.linear_of(oop);
                self.ot[linear].free = true;
                self.free_slot_hint = self.free_slot_hint.min(linear);
                oop = next;
            }
            self.free_lists[size] = UNUSED;
        }
    }

    fn mark_from(&mut self, root: Oop, counts: &mut [u32], stack: &mut Vec<Oop>) {
        stack.push(root);
        while let Some(oop) = stack.pop() {
            if oop == UNUSED || self.is_integer_object(oop) {
                continue;
            }
            let linear = self.tagging.linear_of(oop);
            if linear >= self.used_slots || self.ot[linear].free {
                continue;
            }
            if oop != self.wk.nil {
                counts[linear] += 1;
            }
            if self.ot[linear].mark == self.generation {
                continue;
            }
            self.ot[linear].mark = self.generation;
            let entry = self.ot[linear].clone();
            let class = self.heaps[self.active_heap][entry.address() + 1];
            stack.push(class);
            if entry.pointer_fields {
                let fields = entry.size as usize - HEADER_WORDS;
                for index in 0..fields {
                    stack.push(self.fetch_pointer(index, oop));
                }
            } else if class != UNUSED && class == self.wk.class_compiled_method {
                // Only the header and the literal frame hold references; the
                // bytecode bytes beyond them are opaque.
                let header = self.fetch_pointer(0, oop);
                let literals =
                    self.tagging.literal_count_of(self.integer_value_of(header) as u16);
                for index in 1..=literals {
                    stack.push(self.fetch_pointer(index, oop));
                }
            }
        }
    }

    /// Before marking, singly-referenced keys of the registered dictionaries are
    /// detached (key and parallel value slot set to nil) so that marking decides
    /// their fate; a key reached through another root is restored afterwards.
    fn prepare_purge(&mut self) -> Vec<(Oop, usize, Oop, Oop)> {
        let mut removed = Vec::new();
        let dictionaries = self.purge_dictionaries.clone();
        for dictionary in dictionaries {
            if !self.has_object(dictionary) {
                continue;
            }
            let nil = self.wk.nil;
            let values = self.fetch_pointer(1, dictionary);
            let length = self.word_length_of(dictionary);
            for index in 2..length {
                let key = self.fetch_pointer(index, dictionary);
                if key == nil || self.is_integer_object(key) {
                    continue;
                }
                if self.entry(key).count != 1 {
                    continue;
                }
                let value = self.fetch_pointer(index - 2, values);
                self.store_word(index, dictionary, nil);
                self.store_word(index - 2, values, nil);
                removed.push((dictionary, index, key, value));
            }
        }
        removed
    }

    fn resolve_purge(&mut self, removed: Vec<(Oop, usize, Oop, Oop)>) {
        for (dictionary, index, key, value) in removed {
            if self.entry(key).mark == self.generation {
                let values = self.fetch_pointer(1, dictionary);
                self.store_word(index, dictionary, key);
                self.store_word(index - 2, values, value);
            }
        }
    }

    fn compact(&mut self) {
        let companion = 1 - self.active_heap;
        let mut position = 0;
        for linear in 1..self.used_slots {
            if self.ot[linear].free {
                self.ot[linear] = OtEntry::free_entry();
                continue;
            }
            let address = self.ot[linear].address();
            let size = self.ot[linear].size as usize;
            let (first, second) = self.heaps.split_at_mut(1);
            let (source, destination) = if self.active_heap == 0 {
                (&first[0], &mut second[0])
            } else {
                (&second[0], &mut first[0])
            };
            destination[position..position + size]
                .copy_from_slice(&source[address..address + size]);
            self.ot[linear].set_address(position);
            position += size;
        }
        self.active_heap = companion;
        self.heap_used = position;
        while self.used_slots > 1 && self.ot[self.used_slots - 1].free {
            self.used_slots -= 1;
        }
        self.free_slot_hint = (1..self.used_slots)
            .find(|&l| self.ot[l].free)
            .unwrap_or(self.used_slots);
    }

    /// Claims a specific object pointer and fresh heap space for it. This is the
    /// image-bootstrap path: the loader and the test fixtures use it to put the
    /// well-known objects at their fixed pointers.
    pub fn bootstrap_object(
        &mut self,
        oop: Oop,
        class: Oop,
        pointer_fields: bool,
        odd_length: bool,
        field_words: usize,
    ) -> Oop {
        debug_assert!(!self.is_integer_object(oop));
        let total = field_words + HEADER_WORDS;
        let linear = self.tagging.linear_of(oop);
        assert!(self.ot[linear].free, "oop {:04x} already bootstrapped", oop);
        let address = self.heap_used;
        self.heap_used += total;
        self.heaps[self.active_heap][address] = total as u16;
        self.heaps[self.active_heap][address + 1] = class;
        self.ot[linear] = OtEntry {
            count: 1,
            odd_length,
            pointer_fields,
            free: false,
            segment: 0,
            location: 0,
            size: total as u16,
            mark: 0,
        };
        self.ot[linear].set_address(address);
        self.used_slots = self.used_slots.max(linear + 1);
        self.init_fields(oop, total, pointer_fields);
        oop
    }

    /// Pins an object so it survives every count transition.
    pub fn pin(&mut self, oop: Oop) {
        if self.counted(oop) || oop == self.wk.nil {
            self.entry_mut(oop).count = PINNED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_nil() -> ObjectMemory {
        let mut memory = ObjectMemory::new(Tagging::Classic);
        let nil = memory.wk.nil;
        memory.bootstrap_object(nil, UNUSED, true, false, 0);
        memory.pin(nil);
        memory
    }

    #[test]
    fn store_then_fetch_pointer() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        let holder = memory.instantiate_class_with_pointers(class, 4).unwrap();
        let value = memory.instantiate_class_with_pointers(class, 1).unwrap();
        memory.store_pointer(2, holder, value);
        memory.release_in_hand(value);
        assert_eq!(memory.fetch_pointer(2, holder), value);
        assert_eq!(memory.count_of(value), 1);
    }

    #[test]
    fn fresh_pointer_fields_are_nil() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        let oop = memory.instantiate_class_with_pointers(class, 5).unwrap();
        for index in 0..5 {
            assert_eq!(memory.fetch_pointer(index, oop), memory.wk.nil);
        }
        let bytes = memory.instantiate_class_with_bytes(class, 5).unwrap();
        assert_eq!(memory.byte_length_of(bytes), 5);
        assert_eq!(memory.word_length_of(bytes), 3);
        for index in 0..5 {
            assert_eq!(memory.fetch_byte(index, bytes), 0);
        }
    }

    #[test]
    fn release_recycles_through_free_list() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        memory.pin(class);
        let holder = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let victim = memory.instantiate_class_with_pointers(class, 2).unwrap();
        memory.store_pointer(0, holder, victim);
        memory.release_in_hand(victim);
        let heap_before = memory.heap_used;
        memory.store_pointer(0, holder, memory.wk.nil);
        // Same-size reallocation reuses the chunk without growing the heap.
        let reborn = memory.instantiate_class_with_pointers(class, 2).unwrap();
        assert_eq!(reborn, victim);
        assert_eq!(memory.heap_used, heap_before);
    }

    #[test]
    fn suspended_freeing_defers_release() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        memory.pin(class);
        let holder = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let node = memory.instantiate_class_with_pointers(class, 2).unwrap();
        memory.store_pointer(0, holder, node);
        memory.release_in_hand(node);

        memory.suspend_freeing();
        memory.store_pointer(0, holder, memory.wk.nil);
        // Transiently dead, but not reclaimed: re-link it.
        assert!(memory.has_object(node));
        memory.store_pointer(0, holder, node);
        memory.resume_freeing();
        assert!(memory.has_object(node));
        assert_eq!(memory.fetch_pointer(0, holder), node);
    }

    #[test]
    fn byte_access_is_big_endian_within_words() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        let bytes = memory.instantiate_class_with_bytes(class, 4).unwrap();
        memory.store_byte(0, bytes, 0xAB);
        memory.store_byte(1, bytes, 0xCD);
        assert_eq!(memory.fetch_word(0, bytes), 0xABCD);
    }

    #[test]
    fn become_swaps_identities_but_not_counts() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        memory.pin(class);
        let a = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let b = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let holder = memory.instantiate_class_with_pointers(class, 2).unwrap();
        memory.store_pointer(0, holder, a);
        memory.store_pointer(1, holder, a);
        memory.release_in_hand(a);
        memory.store_word(0, a, 0x1111);
        memory.store_word(0, b, 0x2222);
        let count_a = memory.count_of(a);
        let count_b = memory.count_of(b);

        memory.swap_pointers_of(a, b);
        assert_eq!(memory.fetch_word(0, a), 0x2222);
        assert_eq!(memory.fetch_word(0, b), 0x1111);
        assert_eq!(memory.count_of(a), count_a);
        assert_eq!(memory.count_of(b), count_b);
        // The holder's slots still say "a", which now reaches b's storage.
        assert_eq!(memory.fetch_word(0, memory.fetch_pointer(0, holder)), 0x2222);
    }

    #[test]
    fn gc_reclaims_cycles_and_renormalizes_counts() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        memory.pin(class);

        let keeper = memory.instantiate_class_with_pointers(class, 2).unwrap();
        // A two-object cycle, referenced from nowhere once we let go.
        let x = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let y = memory.instantiate_class_with_pointers(class, 1).unwrap();
        memory.store_pointer(0, x, y);
        memory.store_pointer(0, y, x);
        memory.release_in_hand(x);
        memory.release_in_hand(y);
        assert!(memory.has_object(x) && memory.has_object(y));

        // `keeper` is still in hand and therefore a root on its own.
        memory.collect_garbage(&[]);
        assert!(!memory.has_object(x));
        assert!(!memory.has_object(y));
        assert!(memory.has_object(keeper));
        // Root reference only: count renormalized to one.
        assert_eq!(memory.count_of(keeper), 1);
    }

    #[test]
    fn gc_compacts_into_companion_arena() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        memory.pin(class);
        let keeper = memory.instantiate_class_with_pointers(class, 8).unwrap();
        memory.store_word(0, keeper, 0xBEEF);
        let garbage = memory.instantiate_class_with_pointers(class, 200).unwrap();
        memory.release_in_hand(garbage);
        let arena_before = memory.active_heap;
        let used_before = memory.heap_used;

        memory.collect_garbage(&[]);
        assert_ne!(memory.active_heap, arena_before);
        assert!(memory.heap_used < used_before);
        assert_eq!(memory.fetch_word(0, keeper), 0xBEEF);
        assert_eq!(memory.word_length_of(keeper), 8);
    }

    #[test]
    fn purge_drops_singly_referenced_keys_and_restores_shared_ones() {
        let mut memory = memory_with_nil();
        let class = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        memory.pin(class);

        // dictionary: [tally, values, key, key]; values: [v0, v1].
        let values = memory.instantiate_class_with_pointers(class, 2).unwrap();
        let dictionary = memory.instantiate_class_with_pointers(class, 4).unwrap();
        memory.store_pointer(1, dictionary, values);
        memory.release_in_hand(values);

        let doomed_key = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let doomed_value = memory.instantiate_class_with_pointers(class, 1).unwrap();
        let shared_key = memory.instantiate_class_with_pointers(class, 1).unwrap();
        memory.store_pointer(2, dictionary, doomed_key);
        memory.store_pointer(0, values, doomed_value);
        memory.store_pointer(3, dictionary, shared_key);
        memory.release_in_hand(doomed_key);
        memory.release_in_hand(doomed_value);

        memory.release_in_hand(shared_key);
        // Reachable through the anchor, but with only the dictionary's count:
        // exactly the case the post-mark restore pass exists for.
        let anchor = memory.instantiate_class_with_pointers(class, 1).unwrap();
        memory.store_word(0, anchor, shared_key);

        memory.register_purge_dictionary(dictionary);
        memory.collect_garbage(&[dictionary, anchor]);

        let nil = memory.wk.nil;
        assert_eq!(memory.fetch_pointer(2, dictionary), nil);
        assert!(!memory.has_object(doomed_key));
        assert!(!memory.has_object(doomed_value));
        assert_eq!(memory.fetch_pointer(3, dictionary), shared_key);
        assert!(memory.has_object(shared_key));
    }

    #[test]
    fn instance_enumeration_walks_linear_order() {
        let mut memory = memory_with_nil();
        let class_a = memory.bootstrap_object(0x100, UNUSED, true, false, 3);
        let class_b = memory.bootstrap_object(0x102, UNUSED, true, false, 3);
        memory.pin(class_a);
        memory.pin(class_b);
        let first = memory.instantiate_class_with_pointers(class_a, 1).unwrap();
        let _other = memory.instantiate_class_with_pointers(class_b, 1).unwrap();
        let second = memory.instantiate_class_with_pointers(class_a, 1).unwrap();

        assert_eq!(memory.initial_instance_of(class_a), first);
        assert_eq!(memory.instance_after(first), second);
        assert_eq!(memory.instance_after(second), memory.wk.nil);
    }
}
