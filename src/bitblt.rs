// The raster kernel. A BitBlt object names two forms, a halftone tile, a
// combination rule and three rectangles; copy_bits clips, derives the word
// geometry (skew, edge masks, direction) and then walks destination words
// through a 32-bit shift register. Everything graphical in the system funnels
// through here, including text scanning, lines and circles.

use crate::interpreter::Interpreter;
use crate::memory::ObjectMemory;
use crate::oops::Oop;
use crate::VmError;

// BitBlt receiver fields.
pub const BB_DEST_FORM_INDEX: usize = 0;
pub const BB_SOURCE_FORM_INDEX: usize = 1;
pub const BB_HALFTONE_FORM_INDEX: usize = 2;
pub const BB_COMBINATION_RULE_INDEX: usize = 3;
pub const BB_DEST_X_INDEX: usize = 4;
pub const BB_DEST_Y_INDEX: usize = 5;
pub const BB_WIDTH_INDEX: usize = 6;
pub const BB_HEIGHT_INDEX: usize = 7;
pub const BB_SOURCE_X_INDEX: usize = 8;
pub const BB_SOURCE_Y_INDEX: usize = 9;
pub const BB_CLIP_X_INDEX: usize = 10;
pub const BB_CLIP_Y_INDEX: usize = 11;
pub const BB_CLIP_WIDTH_INDEX: usize = 12;
pub const BB_CLIP_HEIGHT_INDEX: usize = 13;

// CharacterScanner extends BitBlt.
pub const CS_LAST_INDEX_INDEX: usize = 14;
pub const CS_XTABLE_INDEX: usize = 15;
pub const CS_STOP_CONDITIONS_INDEX: usize = 16;

// Form fields.
pub const FORM_BITS_INDEX: usize = 0;
pub const FORM_WIDTH_INDEX: usize = 1;
pub const FORM_HEIGHT_INDEX: usize = 2;
pub const FORM_OFFSET_INDEX: usize = 3;

// Distinguished slots of a stopConditions array (1-based 257 and 258).
const END_OF_RUN_INDEX: usize = 256;
const CROSSED_X_INDEX: usize = 257;

const ALL_ONES: u16 = 0xFFFF;

#[derive(Clone, Copy)]
struct FormInfo {
    bits: Oop,
    width: i32,
    height: i32,
    raster: i32,
}

/// The numeric working state of one raster operation, detached from the heap so
/// the loops can run on plain integers.
pub(crate) struct BitBlt {
    dest: FormInfo,
    source: Option<FormInfo>,
    halftone: Option<Oop>,
    rule: u16,
    pub dest_x: i32,
    pub dest_y: i32,
    pub width: i32,
    pub height: i32,
    pub source_x: i32,
    pub source_y: i32,
    clip_x: i32,
    clip_y: i32,
    clip_width: i32,
    clip_height: i32,
}

fn integer_field(memory: &ObjectMemory, index: usize, oop: Oop) -> Option<i32> {
    let field = memory.fetch_pointer(index, oop);
    if memory.is_integer_object(field) {
        Some(memory.integer_value_of(field) as i32)
    } else {
        None
    }
}

fn form_info(memory: &ObjectMemory, form: Oop) -> Option<FormInfo> {
    if form == memory.wk.nil || memory.is_integer_object(form) || !memory.has_object(form) {
        return None;
    }
    let bits = memory.fetch_pointer(FORM_BITS_INDEX, form);
    if memory.is_integer_object(bits) || !memory.has_object(bits) {
        return None;
    }
    let width = integer_field(memory, FORM_WIDTH_INDEX, form)?;
    let height = integer_field(memory, FORM_HEIGHT_INDEX, form)?;
    Some(FormInfo { bits, width, height, raster: (width + 15) / 16 })
}

fn form_word(memory: &ObjectMemory, form: &FormInfo, index: i32) -> u16 {
    if index >= 0 && (index as usize) < memory.word_length_of(form.bits) {
        memory.fetch_word(index as usize, form.bits)
    } else {
        0
    }
}

fn store_form_word(memory: &mut ObjectMemory, form: &FormInfo, index: i32, value: u16) {
    if index >= 0 && (index as usize) < memory.word_length_of(form.bits) {
        memory.store_word(index as usize, form.bits, value);
    }
}

/// One of the sixteen boolean functions of source and destination.
pub fn merge(rule: u16, source: u16, destination: u16) -> u16 {
    match rule & 15 {
        0 => 0,
        1 => source & destination,
        2 => source & !destination,
        3 => source,
        4 => !source & destination,
        5 => destination,
        6 => source ^ destination,
        7 => source | destination,
        8 => !source & !destination,
        9 => !(source ^ destination),
        10 => !destination,
        11 => source | !destination,
        12 => !source,
        13 => !source | destination,
        14 => !source | !destination,
        _ => ALL_ONES,
    }
}

impl BitBlt {
    pub fn load(memory: &ObjectMemory, blt: Oop) -> Option<BitBlt> {
        if memory.is_integer_object(blt) || !memory.has_object(blt) {
            return None;
        }
        let dest = form_info(memory, memory.fetch_pointer(BB_DEST_FORM_INDEX, blt))?;
        let source_form = memory.fetch_pointer(BB_SOURCE_FORM_INDEX, blt);
        let source = if source_form == memory.wk.nil {
            None
        } else {
            Some(form_info(memory, source_form)?)
        };
        let halftone_form = memory.fetch_pointer(BB_HALFTONE_FORM_INDEX, blt);
        let halftone = if halftone_form == memory.wk.nil {
            None
        } else {
            Some(form_info(memory, halftone_form)?.bits)
        };
        Some(BitBlt {
            dest,
            source,
            halftone,
            rule: integer_field(memory, BB_COMBINATION_RULE_INDEX, blt)? as u16,
            dest_x: integer_field(memory, BB_DEST_X_INDEX, blt)?,
            dest_y: integer_field(memory, BB_DEST_Y_INDEX, blt)?,
            width: integer_field(memory, BB_WIDTH_INDEX, blt)?,
            height: integer_field(memory, BB_HEIGHT_INDEX, blt)?,
            source_x: integer_field(memory, BB_SOURCE_X_INDEX, blt)?,
            source_y: integer_field(memory, BB_SOURCE_Y_INDEX, blt)?,
            clip_x: integer_field(memory, BB_CLIP_X_INDEX, blt)?,
            clip_y: integer_field(memory, BB_CLIP_Y_INDEX, blt)?,
            clip_width: integer_field(memory, BB_CLIP_WIDTH_INDEX, blt)?,
            clip_height: integer_field(memory, BB_CLIP_HEIGHT_INDEX, blt)?,
        })
    }

    fn destination_is(&self, memory: &ObjectMemory, form: Oop) -> bool {
        memory.has_object(form) && memory.fetch_pointer(FORM_BITS_INDEX, form) == self.dest.bits
    }

    /// Runs the operation; the result is the affected destination scan-line
    /// range `[first, last)`, or None when clipping leaves nothing to do.
    pub fn copy_bits(&self, memory: &mut ObjectMemory) -> Option<(i32, i32)> {
        // Stage one: destination against clip rectangle and destination form.
        let mut clip_x = self.clip_x;
        let mut clip_y = self.clip_y;
        let mut clip_width = self.clip_width;
        let mut clip_height = self.clip_height;
        if clip_x < 0 {
            clip_width += clip_x;
            clip_x = 0;
        }
        if clip_y < 0 {
            clip_height += clip_y;
            clip_y = 0;
        }
        clip_width = clip_width.min(self.dest.width - clip_x);
        clip_height = clip_height.min(self.dest.height - clip_y);

        let (mut sx, mut dx, mut w);
        if self.dest_x >= clip_x {
            sx = self.source_x;
            dx = self.dest_x;
            w = self.width;
        } else {
            sx = self.source_x + (clip_x - self.dest_x);
            w = self.width - (clip_x - self.dest_x);
            dx = clip_x;
        }
        if dx + w > clip_x + clip_width {
            w -= dx + w - (clip_x + clip_width);
        }
        let (mut sy, mut dy, mut h);
        if self.dest_y >= clip_y {
            sy = self.source_y;
            dy = self.dest_y;
            h = self.height;
        } else {
            sy = self.source_y + (clip_y - self.dest_y);
            h = self.height - (clip_y - self.dest_y);
            dy = clip_y;
        }
        if dy + h > clip_y + clip_height {
            h -= dy + h - (clip_y + clip_height);
        }

        // Stage two: the implied source rectangle against the source form.
        if let Some(source) = &self.source {
            if sx < 0 {
                dx -= sx;
                w += sx;
                sx = 0;
            }
            if sx + w > source.width {
                w -= sx + w - source.width;
            }
            if sy < 0 {
                dy -= sy;
                h += sy;
                sy = 0;
            }
            if sy + h > source.height {
                h -= sy + h - source.height;
            }
        }
        if w <= 0 || h <= 0 {
            return None;
        }
        let affected = (dy, dy + h);

        // Word geometry: skew, edge masks, row word count.
        let skew = ((sx - dx) & 15) as u16;
        let start_bits = 16 - (dx & 15);
        let mut mask1: u16 = ones(start_bits as u32);
        let end_bits = 15 - ((dx + w - 1) & 15);
        let mut mask2: u16 = !ones(end_bits as u32);
        let mut skew_mask: u16 = if skew == 0 { 0 } else { ones(16 - skew as u32) };
        let n_words;
        if w < start_bits {
            mask1 &= mask2;
            mask2 = 0;
            n_words = 1;
        } else {
            n_words = (w - start_bits + 15) / 16 + 1;
        }

        // Overlap: same bits, destination below or right of source.
        let mut h_dir = 1;
        let mut v_dir = 1;
        if let Some(source) = &self.source {
            if source.bits == self.dest.bits && dy >= sy {
                if dy > sy {
                    v_dir = -1;
                    sy = sy + h - 1;
                    dy = dy + h - 1;
                } else if dx > sx {
                    h_dir = -1;
                    sx = sx + w - 1;
                    dx = dx + w - 1;
                    skew_mask = !skew_mask;
                    std::mem::swap(&mut mask1, &mut mask2);
                }
            }
        }

        // Index calculation, with the preload word priming the shift register.
        let mut preload = self.source.is_some() && skew != 0 && skew <= (sx & 15) as u16;
        if h_dir < 0 {
            preload = !preload;
        }
        let source_raster = self.source.map(|s| s.raster).unwrap_or(0);
        let mut source_index = sy * source_raster + sx / 16;
        let mut dest_index = dy * self.dest.raster + dx / 16;
        let source_delta =
            source_raster * v_dir - (n_words + if preload { 1 } else { 0 }) * h_dir;
        let dest_delta = self.dest.raster * v_dir - n_words * h_dir;

        let mut halftone_row = dy;
        for _ in 0..h {
            let halftone_word = match self.halftone {
                Some(bits) => {
                    let word = memory.fetch_word((halftone_row & 15) as usize, bits);
                    halftone_row += v_dir;
                    word
                }
                None => ALL_ONES,
            };
            let mut skew_word = halftone_word;
            let mut prev_word: u16 = if preload {
                let word = self
                    .source
                    .as_ref()
                    .map(|s| form_word(memory, s, source_index))
                    .unwrap_or(0);
                source_index += h_dir;
                word
            } else {
                0
            };
            let mut merge_mask = mask1;
            for word in 0..n_words {
                if let Some(source) = &self.source {
                    let this_word = form_word(memory, source, source_index);
                    skew_word =
                        (prev_word & skew_mask) | (this_word & !skew_mask);
                    prev_word = this_word;
                    // A 16-bit left rotation by skew.
                    skew_word = skew_word.rotate_left(skew as u32);
                }
                let dest_word = form_word(memory, &self.dest, dest_index);
                let merged = merge(self.rule, skew_word & halftone_word, dest_word);
                store_form_word(
                    memory,
                    &self.dest,
                    dest_index,
                    (merge_mask & merged) | (!merge_mask & dest_word),
                );
                source_index += h_dir;
                dest_index += h_dir;
                merge_mask = if word == n_words - 2 { mask2 } else { ALL_ONES };
            }
            source_index += source_delta;
            dest_index += dest_delta;
        }
        Some(affected)
    }
}

fn ones(count: u32) -> u16 {
    if count >= 16 {
        ALL_ONES
    } else {
        (1u16 << count) - 1
    }
}

// --- primitives ------------------------------------------------------------

pub(crate) fn primitive_copy_bits(interp: &mut Interpreter) -> Result<bool, VmError> {
    let blt_oop = interp.stack_value(0);
    let Some(blt) = BitBlt::load(&interp.memory, blt_oop) else {
        return Ok(false);
    };
    let affected = blt.copy_bits(&mut interp.memory);
    if let Some((first, last)) = affected {
        if blt.destination_is(&interp.memory, interp.display_form) {
            interp.publish_display_rows(first.max(0) as usize, last.max(0) as usize);
        }
    }
    Ok(true)
}

/// The line primitive: a Bresenham walk that re-runs the base copy at every
/// plotted point, stepping the receiver's destination origin.
pub(crate) fn primitive_draw_loop(interp: &mut Interpreter) -> Result<bool, VmError> {
    let blt_oop = interp.stack_value(2);
    let (Some(x_delta), Some(y_delta)) = (interp.stack_integer(1), interp.stack_integer(0))
    else {
        return Ok(false);
    };
    let Some(mut blt) = BitBlt::load(&interp.memory, blt_oop) else {
        return Ok(false);
    };
    let mut dirty: Option<(i32, i32)> = None;
    let mut note = |range: Option<(i32, i32)>, dirty: &mut Option<(i32, i32)>| {
        if let Some((first, last)) = range {
            *dirty = Some(match dirty {
                Some((lo, hi)) => ((*lo).min(first), (*hi).max(last)),
                None => (first, last),
            });
        }
    };

    let dx = x_delta.signum();
    let dy = y_delta.signum();
    let px = y_delta.abs();
    let py = x_delta.abs();
    note(blt.copy_bits(&mut interp.memory), &mut dirty);
    if py > px {
        let mut p = py / 2;
        for _ in 0..py {
            blt.dest_x += dx;
            p -= px;
            if p < 0 {
                blt.dest_y += dy;
                p += py;
            }
            note(blt.copy_bits(&mut interp.memory), &mut dirty);
        }
    } else {
        let mut p = px / 2;
        for _ in 0..px {
            blt.dest_y += dy;
            p -= py;
            if p < 0 {
                blt.dest_x += dx;
                p += px;
            }
            note(blt.copy_bits(&mut interp.memory), &mut dirty);
        }
    }

    let final_x = interp.memory.integer_object_of(blt.dest_x as i16);
    let final_y = interp.memory.integer_object_of(blt.dest_y as i16);
    interp.memory.store_pointer(BB_DEST_X_INDEX, blt_oop, final_x);
    interp.memory.store_pointer(BB_DEST_Y_INDEX, blt_oop, final_y);
    if let Some((first, last)) = dirty {
        if blt.destination_is(&interp.memory, interp.display_form) {
            interp.publish_display_rows(first.max(0) as usize, last.max(0) as usize);
        }
    }
    interp.pop(2);
    Ok(true)
}

/// An eight-way symmetric midpoint circle around the receiver's destination
/// origin, plotted point by point through the base copy. Not bound to a
/// primitive index; exposed for embedders and exercised by the drawing tests.
pub fn draw_circle(interp: &mut Interpreter, blt_oop: Oop, radius: i32) -> Result<bool, VmError> {
    let Some(mut blt) = BitBlt::load(&interp.memory, blt_oop) else {
        return Ok(false);
    };
    let center_x = blt.dest_x;
    let center_y = blt.dest_y;
    let mut dirty: Option<(i32, i32)> = None;
    let mut x = 0;
    let mut y = radius.max(0);
    let mut decision = 3 - 2 * y;
    while x <= y {
        for (px, py) in [
            (center_x + x, center_y + y),
            (center_x - x, center_y + y),
            (center_x + x, center_y - y),
            (center_x - x, center_y - y),
            (center_x + y, center_y + x),
            (center_x - y, center_y + x),
            (center_x + y, center_y - x),
            (center_x - y, center_y - x),
        ] {
            blt.dest_x = px;
            blt.dest_y = py;
            if let Some((first, last)) = blt.copy_bits(&mut interp.memory) {
                dirty = Some(match dirty {
                    Some((lo, hi)) => (lo.min(first), hi.max(last)),
                    None => (first, last),
                });
            }
        }
        if decision < 0 {
            decision += 4 * x + 6;
        } else {
            decision += 4 * (x - y) + 10;
            y -= 1;
        }
        x += 1;
    }
    if let Some((first, last)) = dirty {
        if blt.destination_is(&interp.memory, interp.display_form) {
            interp.publish_display_rows(first.max(0) as usize, last.max(0) as usize);
        }
    }
    Ok(true)
}

/// The text scanning primitive: measure or display characters until a stop
/// condition, the right margin, or the end of the range. Argument order is
/// start, stop, text, rightX, stopConditions, displaying.
pub(crate) fn primitive_scan_characters(interp: &mut Interpreter) -> Result<bool, VmError> {
    let scanner = interp.stack_value(6);
    let (Some(start), Some(stop)) = (interp.stack_integer(5), interp.stack_integer(4)) else {
        return Ok(false);
    };
    let text = interp.stack_value(3);
    let Some(right_x) = interp.stack_integer(2) else {
        return Ok(false);
    };
    let stops = interp.stack_value(1);
    let display_flag = interp.stack_value(0);
    if interp.memory.is_integer_object(text)
        || !interp.memory.has_object(text)
        || interp.memory.is_integer_object(stops)
        || !interp.memory.has_object(stops)
    {
        return Ok(false);
    }
    scan_characters_run(interp, scanner, start, stop, text, right_x, stops, display_flag)
}

fn scan_characters_run(
    interp: &mut Interpreter,
    scanner: Oop,
    start: i32,
    stop: i32,
    text: Oop,
    right_x: i32,
    stops: Oop,
    display_flag: Oop,
) -> Result<bool, VmError> {
    let nil = interp.memory.wk.nil;
    let displaying = display_flag == interp.memory.wk.true_oop;
    let Some(mut blt) = BitBlt::load(&interp.memory, scanner) else {
        return Ok(false);
    };
    let xtable = interp.memory.fetch_pointer(CS_XTABLE_INDEX, scanner);
    if interp.memory.is_integer_object(xtable) || !interp.memory.has_object(xtable) {
        return Ok(false);
    }
    if start < 1 || stop as usize > interp.memory.byte_length_of(text) {
        return Ok(false);
    }
    let stops_length = interp.memory.word_length_of(stops);
    let mut dirty: Option<(i32, i32)> = None;
    let mut index = start;
    let mut outcome = if END_OF_RUN_INDEX < stops_length {
        interp.memory.fetch_pointer(END_OF_RUN_INDEX, stops)
    } else {
        nil
    };
    while index <= stop {
        let ascii = interp.memory.fetch_byte(index as usize - 1, text) as usize;
        let stop_condition = if ascii < stops_length {
            interp.memory.fetch_pointer(ascii, stops)
        } else {
            nil
        };
        if stop_condition != nil {
            outcome = stop_condition;
            break;
        }
        let Some(source_x) = table_entry(interp, xtable, ascii) else { return Ok(false) };
        let Some(next_x) = table_entry(interp, xtable, ascii + 1) else { return Ok(false) };
        let advance = next_x - source_x;
        if blt.dest_x + advance > right_x {
            outcome = if CROSSED_X_INDEX < stops_length {
                interp.memory.fetch_pointer(CROSSED_X_INDEX, stops)
            } else {
                nil
            };
            break;
        }
        if displaying {
            blt.source_x = source_x;
            blt.width = advance;
            if let Some((first, last)) = blt.copy_bits(&mut interp.memory) {
                dirty = Some(match dirty {
                    Some((lo, hi)) => (lo.min(first), hi.max(last)),
                    None => (first, last),
                });
            }
        }
        blt.dest_x += advance;
        index += 1;
    }

    let last_index = interp.memory.integer_object_of(index as i16);
    interp
        .memory
        .store_pointer(CS_LAST_INDEX_INDEX, scanner, last_index);
    let dest_x = interp.memory.integer_object_of(blt.dest_x as i16);
    interp.memory.store_pointer(BB_DEST_X_INDEX, scanner, dest_x);
    if let Some((first, last)) = dirty {
        if blt.destination_is(&interp.memory, interp.display_form) {
            interp.publish_display_rows(first.max(0) as usize, last.max(0) as usize);
        }
    }
    interp.pop(7);
    interp.push(outcome);
    Ok(true)
}

fn table_entry(interp: &Interpreter, table: Oop, index: usize) -> Option<i32> {
    if index >= interp.memory.word_length_of(table) {
        return None;
    }
    let entry = interp.memory.fetch_pointer(index, table);
    if interp.memory.is_integer_object(entry) {
        Some(interp.memory.integer_value_of(entry) as i32)
    } else {
        None
    }
}
