// A Smalltalk-80 virtual machine: object memory, bytecode interpreter and the
// BitBlt raster engine, fed by a snapshot image and wired to a host window. The
// Vm type below is the whole machine; host threads only ever touch it through
// channels and the shared frame buffer.

pub mod bitblt;
mod bytecodes;
pub mod display;
pub mod interpreter;
pub mod memory;
pub mod oops;
mod primitives;
pub mod scheduler;
pub mod snapshot;

use interpreter::{Bridges, Interpreter};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    #[error("object memory exhausted (heap)")]
    OutOfHeap,
    #[error("object memory exhausted (object table)")]
    OutOfObjectTable,
    #[error("corrupt image: {0}")]
    CorruptImage(String),
    #[error("doesNotUnderstand: is itself not understood")]
    RecursiveDoesNotUnderstand,
    #[error("unknown bytecode {0}")]
    UnknownBytecode(u8),
    #[error("snapshot: {0}")]
    Snapshot(#[from] std::io::Error),
    #[error("host window: {0}")]
    Host(String),
    #[error("quit requested")]
    Quit,
}

/// Counters shared with the host side for the status line and exit statistics.
#[derive(Default)]
pub struct Stats {
    bytecodes: AtomicU64,
    sends: AtomicU64,
    primitives: AtomicU64,
    process_switches: AtomicU64,
}

impl Stats {
    pub fn note_bytecode(&self) {
        self.bytecodes.fetch_add(1, Ordering::Relaxed);
    }
    pub fn note_send(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }
    pub fn note_primitive(&self) {
        self.primitives.fetch_add(1, Ordering::Relaxed);
    }
    pub fn note_process_switch(&self) {
        self.process_switches.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bytecodes(&self) -> u64 {
        self.bytecodes.load(Ordering::Relaxed)
    }
    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }
    pub fn primitives(&self) -> u64 {
        self.primitives.load(Ordering::Relaxed)
    }
    pub fn process_switches(&self) -> u64 {
        self.process_switches.load(Ordering::Relaxed)
    }
}

/// The assembled machine.
pub struct Vm {
    pub interpreter: Interpreter,
}

impl Vm {
    /// Loads the image, wires the bridges and resumes the image's active
    /// process.
    pub fn boot(image: &Path, bridges: Bridges) -> Result<Vm, VmError> {
        let memory = snapshot::load_image(image)?;
        let mut interpreter = Interpreter::new(memory, bridges);
        interpreter.boot()?;
        Ok(Vm { interpreter })
    }

    /// Drives the interpreter until it quits or dies; external state is flushed
    /// on every exit path.
    pub fn run(&mut self) -> Result<(), VmError> {
        let outcome = self.interpreter.run();
        if let Err(problem) = self.interpreter.disk.save_changes() {
            error!("flushing vendor disk changes failed: {}", problem);
        }
        match outcome {
            Err(VmError::Quit) => {
                info!(
                    "interpreter quit after {} bytecodes",
                    self.interpreter.stats.bytecodes()
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Announces where the next snapshot goes.
    pub fn set_snapshot_filename(&mut self, name: PathBuf) {
        self.interpreter.snapshot_path = name;
    }

    /// Persists the object memory (archiving the previous snapshot) together
    /// with the external disk state.
    pub fn save_snapshot(&mut self) -> Result<(), VmError> {
        self.interpreter.store_context_registers();
        let roots = self.interpreter.gc_roots();
        let path = self.interpreter.snapshot_path.clone();
        snapshot::save_snapshot(&mut self.interpreter.memory, &roots, &path)?;
        self.interpreter.flush_method_cache();
        self.save_external_changes()
    }

    pub fn save_external_changes(&mut self) -> Result<(), VmError> {
        self.interpreter.disk.save_changes()?;
        Ok(())
    }

    /// Enqueues one input event word from the host.
    pub fn input_event(&self, word: u16) {
        let _ = self
            .interpreter
            .host_tx
            .send(display::HostMessage::Event(word));
    }
}
