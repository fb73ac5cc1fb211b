// Reading and writing the image file: a big-endian, 16-bit-word stream padded to
// 256-word pages. Page 0 is the header, followed by the live heap and then the
// object table in linear order. Loading ends with a full collection so the heap
// is compacted and the counts renormalized before the first bytecode runs.

use crate::interpreter::{HOME_INDEX, METHOD_INDEX, VALUE_INDEX};
use crate::memory::{ObjectMemory, OtEntry, HEAP_WORDS};
use crate::oops::{Oop, Tagging, HEADER_WORDS, UNUSED};
use crate::scheduler::{ACTIVE_PROCESS_INDEX, SUSPENDED_CONTEXT_INDEX};
use crate::VmError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Words per file page.
pub const PAGE_WORDS: usize = 256;

/// Loads an image and leaves the object memory compacted and count-normalized.
pub fn load_image(path: &Path) -> Result<ObjectMemory, VmError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let heap_words = reader.read_u32::<BigEndian>()? as usize;
    let ot_words = reader.read_u32::<BigEndian>()? as usize;
    let stretch_flag = reader.read_u16::<BigEndian>()?;
    for _ in 5..PAGE_WORDS {
        reader.read_u16::<BigEndian>()?;
    }
    if heap_words > HEAP_WORDS || ot_words % 2 != 0 {
        return Err(VmError::CorruptImage(format!(
            "implausible header: {} heap words, {} table words",
            heap_words, ot_words
        )));
    }

    let heap_pages = heap_words.div_ceil(PAGE_WORDS);
    let mut heap = vec![0u16; HEAP_WORDS];
    for word in heap.iter_mut().take(heap_pages * PAGE_WORDS) {
        *word = reader.read_u16::<BigEndian>()?;
    }

    let entries = ot_words / 2;
    let mut table = Vec::with_capacity(entries);
    for _ in 0..entries {
        let flags = reader.read_u16::<BigEndian>()?;
        let location = reader.read_u16::<BigEndian>()?;
        table.push((flags, location));
    }

    let tagging = detect_tagging(stretch_flag, &table, &heap)?;
    if entries > tagging.object_slots() {
        return Err(VmError::CorruptImage(format!(
            "{} table entries exceed the {} scheme's {} slots",
            entries,
            tagging,
            tagging.object_slots()
        )));
    }

    let mut memory = ObjectMemory::new(tagging);
    memory.heaps[0][..heap_words].copy_from_slice(&heap[..heap_words]);
    memory.active_heap = 0;
    memory.heap_used = heap_words;
    memory.used_slots = entries;

    // Older images leave the segment nibble zero everywhere; the heap is laid
    // out in linear order there, so a location going backwards marks a segment
    // boundary and the nibble can be repaired on the way in.
    let mut running_segment: u8 = 0;
    let mut previous_location: u32 = 0;
    for (linear, &(flags, location)) in table.iter().enumerate() {
        let free = flags & 0x20 != 0;
        if free {
            memory.ot[linear] = OtEntry::free_entry();
            continue;
        }
        let mut segment = (flags & 0x0F) as u8;
        if heap_words > 0x10000 && segment == 0 {
            if (location as u32) < previous_location {
                running_segment += 1;
            }
            segment = running_segment;
        } else {
            running_segment = segment;
        }
        previous_location = location as u32;

        let address = ((segment as usize) << 16) | location as usize;
        if address + HEADER_WORDS > heap_words {
            return Err(VmError::CorruptImage(format!(
                "table entry {} points past the heap ({:05x})",
                linear, address
            )));
        }
        let size = memory.heaps[0][address];
        if size < HEADER_WORDS as u16 || address + size as usize > heap_words {
            return Err(VmError::CorruptImage(format!(
                "object at {:05x} declares bad size {}",
                address, size
            )));
        }
        memory.ot[linear] = OtEntry {
            count: (flags >> 8) as u8,
            odd_length: flags & 0x80 != 0,
            pointer_fields: flags & 0x40 != 0,
            free: false,
            segment,
            location,
            size,
            mark: 0,
        };
    }

    let nil = memory.wk.nil;
    if !memory.has_object(nil) {
        return Err(VmError::CorruptImage("image has no nil".into()));
    }
    memory.pin(nil);
    memory.pin(memory.wk.true_oop);
    memory.pin(memory.wk.false_oop);

    // The collector treats compiled methods specially (header and literal frame
    // only), so their class must be known before the post-load collection; the
    // image names it nowhere, but the active context's method is one.
    discover_undeclared_classes(&mut memory);
    memory.collect_garbage(&[]);
    info!(
        "loaded {} image: {} heap words, {} objects, tagging {}",
        path.display(),
        memory.heap_used,
        entries,
        tagging
    );
    Ok(memory)
}

fn discover_undeclared_classes(memory: &mut ObjectMemory) {
    let association = memory.wk.scheduler_association;
    if !memory.has_object(association) {
        return;
    }
    let scheduler = memory.fetch_pointer(VALUE_INDEX, association);
    if !memory.has_object(scheduler) {
        return;
    }
    let process = memory.fetch_pointer(ACTIVE_PROCESS_INDEX, scheduler);
    if !memory.has_object(process) {
        return;
    }
    let mut context = memory.fetch_pointer(SUSPENDED_CONTEXT_INDEX, process);
    if !memory.has_object(context) {
        return;
    }
    let mut method = memory.fetch_pointer(METHOD_INDEX, context);
    if memory.is_integer_object(method) {
        // A block context: its home holds the real method.
        context = memory.fetch_pointer(HOME_INDEX, context);
        if !memory.has_object(context) {
            return;
        }
        method = memory.fetch_pointer(METHOD_INDEX, context);
    }
    if memory.has_object(method) {
        memory.wk.class_compiled_method = memory.fetch_class_of(method);
    }
    let understand = memory.wk.selector_does_not_understand;
    if memory.has_object(understand) {
        memory.wk.class_symbol = memory.fetch_class_of(understand);
    }
}

/// The header flag decides when present; without it, the class-pointer word in
/// nil's header must be a valid heap pointer, and an odd value there can only be
/// a stretch pointer. Nil sits at linear slot 1 under both schemes.
fn detect_tagging(
    stretch_flag: u16,
    table: &[(u16, u16)],
    heap: &[u16],
) -> Result<Tagging, VmError> {
    if stretch_flag == 1 {
        return Ok(Tagging::Stretch);
    }
    let (flags, location) = *table
        .get(1)
        .ok_or_else(|| VmError::CorruptImage("object table too small for nil".into()))?;
    if flags & 0x20 != 0 {
        return Err(VmError::CorruptImage("nil's table entry is free".into()));
    }
    let address = (((flags & 0x0F) as usize) << 16) | location as usize;
    let class_word = *heap
        .get(address + 1)
        .ok_or_else(|| VmError::CorruptImage("nil's header lies outside the heap".into()))?;
    if class_word & 1 == 1 {
        Ok(Tagging::Stretch)
    } else {
        Ok(Tagging::Classic)
    }
}

/// Collects, then writes the whole object memory. `roots` are the interpreter
/// registers that must survive the pre-save collection.
pub fn save_image(memory: &mut ObjectMemory, roots: &[Oop], path: &Path) -> Result<(), VmError> {
    memory.collect_garbage(roots);

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let heap_words = memory.heap_used;
    let ot_words = memory.used_slots * 2;
    writer.write_u32::<BigEndian>(heap_words as u32)?;
    writer.write_u32::<BigEndian>(ot_words as u32)?;
    writer.write_u16::<BigEndian>(if memory.tagging == Tagging::Stretch { 1 } else { 0 })?;
    for _ in 5..PAGE_WORDS {
        writer.write_u16::<BigEndian>(0)?;
    }

    for index in 0..heap_words {
        writer.write_u16::<BigEndian>(memory.heaps[memory.active_heap][index])?;
    }
    pad_page(&mut writer, heap_words)?;

    for linear in 0..memory.used_slots {
        let entry = &memory.ot[linear];
        let flags = ((entry.count as u16) << 8)
            | if entry.odd_length { 0x80 } else { 0 }
            | if entry.pointer_fields { 0x40 } else { 0 }
            | if entry.free { 0x20 } else { 0 }
            | (entry.segment & 0x0F) as u16;
        writer.write_u16::<BigEndian>(flags)?;
        writer.write_u16::<BigEndian>(if entry.free { UNUSED } else { entry.location })?;
    }
    pad_page(&mut writer, ot_words)?;
    writer.flush()?;

    info!(
        "saved {}: {} heap words, {} table entries",
        path.display(),
        heap_words,
        memory.used_slots
    );
    Ok(())
}

/// Saves to `path`, moving any previous snapshot aside first.
pub fn save_snapshot(memory: &mut ObjectMemory, roots: &[Oop], path: &Path) -> Result<(), VmError> {
    if path.exists() {
        let mut archived = path.as_os_str().to_owned();
        archived.push(".bak");
        fs::rename(path, &archived)?;
        info!("archived previous snapshot as {}", Path::new(&archived).display());
    }
    save_image(memory, roots, path)
}

fn pad_page<W: Write>(writer: &mut W, words_written: usize) -> Result<(), VmError> {
    let remainder = words_written % PAGE_WORDS;
    if remainder != 0 {
        for _ in remainder..PAGE_WORDS {
            writer.write_u16::<BigEndian>(0)?;
        }
    }
    Ok(())
}
