use clap::Parser;
use crossbeam_channel::unbounded;
use log::{error, info, warn};
use st80::display::{DisplayHandle, HostWindow, NullDisk};
use st80::interpreter::Bridges;
use st80::{Stats, Vm};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A Smalltalk-80 virtual machine.
#[derive(Parser)]
#[command(name = "st80", version, about)]
struct Args {
    /// Snapshot image to run (the .im suffix may be omitted)
    image: PathBuf,
    /// Render a live status line on the terminal
    #[arg(long)]
    status: bool,
    /// Print execution statistics on exit
    #[arg(long)]
    stats: bool,
    /// Minutes east of UTC for the image's local clock
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    tz_offset: i32,
}

fn resolve_image(path: &PathBuf) -> PathBuf {
    if path.exists() {
        return path.clone();
    }
    let with_suffix = path.with_extension("im");
    if with_suffix.exists() {
        return with_suffix;
    }
    path.clone()
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let image = resolve_image(&args.image);

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = Arc::clone(&quit);
        ctrlc::set_handler(move || quit.store(true, Ordering::Relaxed))
            .expect("installing the interrupt handler");
    }

    let (host_tx, host_rx) = unbounded();
    let display = DisplayHandle::new();
    let stats = Arc::new(Stats::default());
    let bridges = Bridges {
        host_rx,
        host_tx: host_tx.clone(),
        display: display.clone(),
        disk: Box::new(NullDisk),
        quit: Arc::clone(&quit),
        stats: Arc::clone(&stats),
        tz_offset_minutes: args.tz_offset,
        snapshot_path: image.clone(),
    };

    let mut vm = match Vm::boot(&image, bridges) {
        Ok(vm) => vm,
        Err(problem) => {
            error!("cannot boot {}: {}", image.display(), problem);
            return ExitCode::FAILURE;
        }
    };
    info!("booting {}", image.display());

    let interpreter_thread = thread::spawn(move || {
        let outcome = vm.run();
        if let Err(problem) = &outcome {
            error!("virtual machine died: {}", problem);
        }
        outcome
    });

    match HostWindow::open(
        display,
        host_tx,
        Arc::clone(&quit),
        Arc::clone(&stats),
        args.status,
        args.tz_offset,
    ) {
        Ok(mut window) => window.pump(),
        Err(problem) => {
            // No display surface: run headless until the interpreter is done.
            warn!("no host window ({}), running headless", problem);
            while !quit.load(Ordering::Relaxed) && !interpreter_thread.is_finished() {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    quit.store(true, Ordering::Relaxed);

    let code = match interpreter_thread.join() {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(_)) => ExitCode::FAILURE,
        Err(_) => {
            error!("interpreter thread panicked; image state may be stale");
            ExitCode::FAILURE
        }
    };

    if args.stats {
        println!(
            "bytecodes {}  sends {}  primitives {}  process switches {}",
            stats.bytecodes(),
            stats.sends(),
            stats.primitives(),
            stats.process_switches()
        );
    }
    code
}
