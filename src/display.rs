// The host side of the machine: a shared frame buffer the interpreter's BitBlt
// publishes dirty scan lines into, a minifb window that renders it at roughly
// 24 ms cadence and turns keyboard and mouse state into the 16-bit input event
// words, and the trait behind which the emulated vendor disk lives.

use crate::memory::ObjectMemory;
use crate::oops::Oop;
use crate::{Stats, VmError};
use crossbeam_channel::Sender;
use log::info;
use minifb::{Key, MouseButton, MouseMode, Window, WindowOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use termion::{clear, color};

/// What host threads push at the interpreter. One queue keeps the words and the
/// semaphore ticks in a single FIFO order.
pub enum HostMessage {
    /// A 16-bit input event word, per the encoding below.
    Event(u16),
    /// The tick timer fired; stale sequence numbers are ignored.
    TickFired(u64),
    Quit,
}

// Event word type nibbles.
const EVENT_DELTA_X: u16 = 0x1000;
const EVENT_DELTA_Y: u16 = 0x2000;
const EVENT_KEY_DOWN: u16 = 0x3000;
const EVENT_KEY_UP: u16 = 0x4000;
const EVENT_ABSOLUTE_TIME: u16 = 0x5000;

// Special key codes beyond the ASCII range.
const KEY_MOUSE_RIGHT: u16 = 128;
const KEY_MOUSE_MIDDLE: u16 = 129;
const KEY_MOUSE_LEFT: u16 = 130;
const KEY_LEFT_SHIFT: u16 = 136;
const KEY_RIGHT_SHIFT: u16 = 137;
const KEY_CONTROL: u16 = 138;
const KEY_ALPHA_LOCK: u16 = 139;

/// Seconds between 1901-01-01 and the Unix epoch.
const SMALLTALK_EPOCH_OFFSET: i64 = 2_177_452_800;

pub struct FrameBuffer {
    pub width: usize,
    pub height: usize,
    pub raster: usize,
    pub bits: Vec<u16>,
    pub dirty: Option<(usize, usize)>,
    pub installed: bool,
    pub cursor: [u16; 16],
    pub cursor_hotspot: (i16, i16),
    pub mouse: (i16, i16),
}

impl FrameBuffer {
    fn new() -> Self {
        FrameBuffer {
            width: 0,
            height: 0,
            raster: 0,
            bits: Vec::new(),
            dirty: None,
            installed: false,
            cursor: [0; 16],
            cursor_hotspot: (0, 0),
            mouse: (0, 0),
        }
    }
}

/// Cloneable handle on the shared frame state; the interpreter writes, the
/// window pump reads.
#[derive(Clone)]
pub struct DisplayHandle {
    shared: Arc<Mutex<FrameBuffer>>,
}

impl Default for DisplayHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayHandle {
    pub fn new() -> Self {
        DisplayHandle { shared: Arc::new(Mutex::new(FrameBuffer::new())) }
    }

    pub fn configure(&self, width: usize, height: usize) {
        let mut frame = self.shared.lock().expect("display state");
        frame.width = width;
        frame.height = height;
        frame.raster = (width + 15) / 16;
        frame.bits = vec![0; frame.raster * height];
        frame.installed = true;
        frame.dirty = Some((0, height));
        info!("display configured {}x{}", width, height);
    }

    /// Publishes scan lines `[first, last)`; `words` holds them packed at
    /// `raster` words per line.
    pub fn copy_bits(&self, words: &[u16], raster: usize, first: usize, last: usize) {
        let mut frame = self.shared.lock().expect("display state");
        if !frame.installed || raster != frame.raster {
            return;
        }
        let last = last.min(frame.height);
        for line in first..last {
            let from = (line - first) * raster;
            let to = line * raster;
            if from + raster <= words.len() && to + raster <= frame.bits.len() {
                frame.bits[to..to + raster].copy_from_slice(&words[from..from + raster]);
            }
        }
        frame.dirty = Some(match frame.dirty {
            Some((lo, hi)) => (lo.min(first), hi.max(last)),
            None => (first, last),
        });
    }

    pub fn set_cursor(&self, bits: [u16; 16], hot_x: i16, hot_y: i16) {
        let mut frame = self.shared.lock().expect("display state");
        frame.cursor = bits;
        frame.cursor_hotspot = (hot_x, hot_y);
        frame.dirty = Some((0, frame.height));
    }

    pub fn set_cursor_position(&self, x: i16, y: i16) {
        let mut frame = self.shared.lock().expect("display state");
        frame.mouse = (x, y);
    }

    pub fn mouse_point(&self) -> (i16, i16) {
        let frame = self.shared.lock().expect("display state");
        frame.mouse
    }

    /// Direct access to the frame state, for the pump and for embedders that
    /// render some other way.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, FrameBuffer> {
        self.shared.lock().expect("display state")
    }
}

/// The emulated vendor disk, reached through two primitives. `None` from either
/// operation fails the primitive and defers to the image's own code.
pub trait VendorDisk: Send {
    fn control(&mut self, memory: &mut ObjectMemory, receiver: Oop, arguments: &[Oop])
        -> Option<Oop>;
    fn transfer(&mut self, memory: &mut ObjectMemory, receiver: Oop, arguments: &[Oop])
        -> Option<Oop>;
    /// Persists outstanding disk deltas; called on quit and around snapshots.
    fn save_changes(&mut self) -> std::io::Result<()>;
}

/// The default: no disk attached, every disk primitive declines.
pub struct NullDisk;

impl VendorDisk for NullDisk {
    fn control(&mut self, _: &mut ObjectMemory, _: Oop, _: &[Oop]) -> Option<Oop> {
        None
    }
    fn transfer(&mut self, _: &mut ObjectMemory, _: Oop, _: &[Oop]) -> Option<Oop> {
        None
    }
    fn save_changes(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Keys the pump watches, with their unshifted codes.
const KEY_MAP: [(Key, u16); 53] = [
    (Key::A, 97),
    (Key::B, 98),
    (Key::C, 99),
    (Key::D, 100),
    (Key::E, 101),
    (Key::F, 102),
    (Key::G, 103),
    (Key::H, 104),
    (Key::I, 105),
    (Key::J, 106),
    (Key::K, 107),
    (Key::L, 108),
    (Key::M, 109),
    (Key::N, 110),
    (Key::O, 111),
    (Key::P, 112),
    (Key::Q, 113),
    (Key::R, 114),
    (Key::S, 115),
    (Key::T, 116),
    (Key::U, 117),
    (Key::V, 118),
    (Key::W, 119),
    (Key::X, 120),
    (Key::Y, 121),
    (Key::Z, 122),
    (Key::Key0, 48),
    (Key::Key1, 49),
    (Key::Key2, 50),
    (Key::Key3, 51),
    (Key::Key4, 52),
    (Key::Key5, 53),
    (Key::Key6, 54),
    (Key::Key7, 55),
    (Key::Key8, 56),
    (Key::Key9, 57),
    (Key::Space, 32),
    (Key::Enter, 13),
    (Key::Backspace, 8),
    (Key::Tab, 9),
    (Key::Escape, 27),
    (Key::Delete, 127),
    (Key::Minus, 45),
    (Key::Equal, 61),
    (Key::LeftBracket, 91),
    (Key::RightBracket, 93),
    (Key::Backslash, 92),
    (Key::Semicolon, 59),
    (Key::Apostrophe, 39),
    (Key::Comma, 44),
    (Key::Period, 46),
    (Key::Slash, 47),
    (Key::Backquote, 96),
];

const MODIFIER_MAP: [(Key, u16); 5] = [
    (Key::LeftShift, KEY_LEFT_SHIFT),
    (Key::RightShift, KEY_RIGHT_SHIFT),
    (Key::LeftCtrl, KEY_CONTROL),
    (Key::RightCtrl, KEY_CONTROL),
    (Key::CapsLock, KEY_ALPHA_LOCK),
];

/// The main-thread window: renders the shared frame buffer and feeds event
/// words back through the channel.
pub struct HostWindow {
    window: Window,
    frame: DisplayHandle,
    tx: Sender<HostMessage>,
    quit: Arc<AtomicBool>,
    stats: Arc<Stats>,
    show_status: bool,
    tz_offset_minutes: i32,
    pixels: Vec<u32>,
    last_mouse: Option<(i16, i16)>,
    keys_down: Vec<u16>,
    buttons: [bool; 3],
    last_event: Instant,
    status_at: Instant,
    last_bytecodes: u64,
}

impl HostWindow {
    pub fn open(
        frame: DisplayHandle,
        tx: Sender<HostMessage>,
        quit: Arc<AtomicBool>,
        stats: Arc<Stats>,
        show_status: bool,
        tz_offset_minutes: i32,
    ) -> Result<HostWindow, VmError> {
        let window = Window::new("Smalltalk-80", 640, 480, WindowOptions::default())
            .map_err(|problem| VmError::Host(problem.to_string()))?;
        let mut host = HostWindow {
            window,
            frame,
            tx,
            quit,
            stats,
            show_status,
            tz_offset_minutes,
            pixels: vec![0xFFFFFF; 640 * 480],
            last_mouse: None,
            keys_down: Vec::new(),
            buttons: [false; 3],
            last_event: Instant::now(),
            status_at: Instant::now(),
            last_bytecodes: 0,
        };
        host.window
            .limit_update_rate(Some(Duration::from_millis(24)));
        Ok(host)
    }

    /// Runs until the window closes or the quit flag trips.
    pub fn pump(&mut self) {
        while self.window.is_open() && !self.quit.load(Ordering::Relaxed) {
            self.poll_input();
            self.render();
            if self.show_status && self.status_at.elapsed() >= Duration::from_secs(1) {
                self.print_status();
            }
        }
        self.quit.store(true, Ordering::Relaxed);
        let _ = self.tx.send(HostMessage::Quit);
    }

    fn send_event(&mut self, word: u16) {
        let _ = self.tx.send(HostMessage::Event(word));
    }

    /// Every batch of events is preceded by a time word: a bare millisecond
    /// delta when it fits twelve bits, otherwise an absolute stamp.
    fn send_time_word(&mut self) {
        let elapsed = self.last_event.elapsed().as_millis() as u64;
        self.last_event = Instant::now();
        if elapsed == 0 {
            return;
        }
        if elapsed <= 0xFFF {
            self.send_event(elapsed as u16);
        } else {
            let seconds = (chrono::Utc::now().timestamp()
                + self.tz_offset_minutes as i64 * 60
                + SMALLTALK_EPOCH_OFFSET) as u32;
            self.send_event(EVENT_ABSOLUTE_TIME);
            self.send_event((seconds >> 16) as u16);
            self.send_event(seconds as u16);
        }
    }

    fn poll_input(&mut self) {
        let mut pending: Vec<u16> = Vec::new();

        if let Some((x, y)) = self.window.get_mouse_pos(MouseMode::Clamp) {
            let position = (x as i16, y as i16);
            if let Some(last) = self.last_mouse {
                let dx = position.0 - last.0;
                let dy = position.1 - last.1;
                if dx != 0 {
                    pending.push(EVENT_DELTA_X | (dx as u16 & 0x0FFF));
                }
                if dy != 0 {
                    pending.push(EVENT_DELTA_Y | (dy as u16 & 0x0FFF));
                }
            }
            self.last_mouse = Some(position);
            self.frame.set_cursor_position(position.0, position.1);
        }

        let buttons = [
            (MouseButton::Left, KEY_MOUSE_LEFT, 0usize),
            (MouseButton::Middle, KEY_MOUSE_MIDDLE, 1),
            (MouseButton::Right, KEY_MOUSE_RIGHT, 2),
        ];
        for (button, code, slot) in buttons {
            let down = self.window.get_mouse_down(button);
            if down != self.buttons[slot] {
                self.buttons[slot] = down;
                pending.push(if down { EVENT_KEY_DOWN | code } else { EVENT_KEY_UP | code });
            }
        }

        let mut now_down: Vec<u16> = Vec::new();
        for &(key, code) in KEY_MAP.iter().chain(MODIFIER_MAP.iter()) {
            if self.window.is_key_down(key) {
                now_down.push(code);
            }
        }
        for code in &now_down {
            if !self.keys_down.contains(code) {
                pending.push(EVENT_KEY_DOWN | code);
            }
        }
        for code in &self.keys_down {
            if !now_down.contains(code) {
                pending.push(EVENT_KEY_UP | code);
            }
        }
        self.keys_down = now_down;

        if !pending.is_empty() {
            self.send_time_word();
            for word in pending {
                self.send_event(word);
            }
        }
    }

    fn render(&mut self) {
        let (width, height, pixels) = {
            let mut frame = self.frame.shared.lock().expect("display state");
            if !frame.installed || frame.width == 0 {
                drop(frame);
                self.window.update();
                return;
            }
            frame.dirty = None;
            let width = frame.width;
            let height = frame.height;
            if self.pixels.len() != width * height {
                self.pixels = vec![0xFFFFFF; width * height];
            }
            for y in 0..height {
                for word_index in 0..frame.raster {
                    let word = frame.bits[y * frame.raster + word_index];
                    let base = y * width + word_index * 16;
                    for bit in 0..16 {
                        let x = word_index * 16 + bit;
                        if x < width {
                            // A one bit is black ink on the white ground.
                            self.pixels[base + bit] =
                                if word & (0x8000 >> bit) != 0 { 0x000000 } else { 0xFFFFFF };
                        }
                    }
                }
            }
            // The hardware cursor, composed over the frame at the mouse point.
            let (hot_x, hot_y) = frame.cursor_hotspot;
            let (mx, my) = frame.mouse;
            for row in 0..16i32 {
                let y = my as i32 - hot_y as i32 + row;
                if y < 0 || y >= height as i32 {
                    continue;
                }
                let word = frame.cursor[row as usize];
                for bit in 0..16i32 {
                    let x = mx as i32 - hot_x as i32 + bit;
                    if x < 0 || x >= width as i32 {
                        continue;
                    }
                    if word & (0x8000 >> bit) != 0 {
                        self.pixels[y as usize * width + x as usize] = 0x000000;
                    }
                }
            }
            (width, height, self.pixels.clone())
        };
        self.window
            .update_with_buffer(&pixels, width, height)
            .expect("updating the host window");
    }

    fn print_status(&mut self) {
        let bytecodes = self.stats.bytecodes();
        let rate = bytecodes - self.last_bytecodes;
        self.last_bytecodes = bytecodes;
        self.status_at = Instant::now();
        print!(
            "\r{}{}st80{} {} bytecodes/s, {} sends, {} switches",
            clear::CurrentLine,
            color::Fg(color::Green),
            color::Fg(color::Reset),
            rate,
            self.stats.sends(),
            self.stats.process_switches(),
        );
        let _ = std::io::stdout().flush();
    }
}
