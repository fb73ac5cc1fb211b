// End-to-end scenarios driven through synthetic images: the arithmetic fast
// path, primitive-failure fallback, doesNotUnderstand:, the scheduler, input
// events and a behavioral snapshot round trip.

mod common;

use common::{fixture, int, top, MethodSpec};
use st80::interpreter::{Bridges, Interpreter, MESSAGE_ARGUMENTS_INDEX, MESSAGE_SELECTOR_INDEX};
use st80::oops::Tagging;
use st80::scheduler::{EXCESS_SIGNALS_INDEX, FIRST_LINK_INDEX, PRIORITY_INDEX};
use st80::{snapshot, Vm};

#[test]
fn integer_add_fast_path_activates_no_method() {
    let classic = Tagging::Classic;
    let mut fx = fixture(
        &[classic.integer_object_of(3), classic.integer_object_of(4)],
        &[32, 33, 176, 124],
    );
    let main = fx.main_context;
    fx.run_steps(3);
    assert_eq!(top(&fx.interp), int(fx.memory(), 7));
    assert_eq!(fx.interp.stats.sends(), 0, "no method activation may occur");
    assert_eq!(fx.interp.active_context, main);
}

#[test]
fn integer_overflow_falls_back_to_a_send() {
    let classic = Tagging::Classic;
    let mut fx = fixture(
        &[classic.integer_object_of(16000), classic.integer_object_of(1000)],
        &[32, 33, 184, 124],
    );
    // SmallInteger>>* answers a LargePositiveInteger built by image-level code;
    // here it is a literal holding the bytes of 16_000_000, low byte first.
    let large = fx
        .interp
        .memory
        .instantiate_class_with_bytes(fx.class_large_positive_integer, 3)
        .unwrap();
    fx.interp.memory.store_byte(0, large, 0x00);
    fx.interp.memory.store_byte(1, large, 0x24);
    fx.interp.memory.store_byte(2, large, 0xF4);
    let product = fx.method(
        fx.class_small_integer,
        MethodSpec {
            argument_count: 1,
            temporaries: 0,
            primitive: None,
            literals: &[large],
            bytecodes: &[32, 124],
        },
    );
    let sym_times = fx.sym_times;
    fx.install(fx.class_small_integer, sym_times, product);
    fx.interp.memory.release_in_hand(large);

    let main = fx.main_context;
    fx.run_steps(2);
    fx.run_steps(1); // the * bytecode: primitive fails, the send activates
    assert_eq!(fx.interp.stats.sends(), 1);
    assert_ne!(fx.interp.active_context, main);
    fx.run_steps(2); // push literal, return
    assert_eq!(fx.interp.active_context, main);
    let result = top(&fx.interp);
    assert_eq!(
        fx.memory().fetch_class_of(result),
        fx.class_large_positive_integer
    );
    assert_eq!(fx.memory().fetch_byte(0, result), 0x00);
    assert_eq!(fx.memory().fetch_byte(1, result), 0x24);
    assert_eq!(fx.memory().fetch_byte(2, result), 0xF4);
}

#[test]
fn does_not_understand_wraps_the_message() {
    let mut fx = fixture(&[], &[120]);
    let array = fx
        .interp
        .memory
        .instantiate_class_with_pointers(fx.class_array, 0)
        .unwrap();
    let sym_bogus = fx.sym_bogus;
    let probe = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: None,
            literals: &[array, sym_bogus],
            bytecodes: &[32, 209, 124],
        },
    );
    fx.interp.memory.release_in_hand(array);
    let answer_message = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 1,
            temporaries: 0,
            primitive: None,
            literals: &[],
            bytecodes: &[16, 124],
        },
    );
    let dnu = fx.memory().wk.selector_does_not_understand;
    fx.install(fx.class_object, dnu, answer_message);

    let receiver = fx
        .interp
        .memory
        .instantiate_class_with_pointers(fx.class_object, 0)
        .unwrap();
    let context = fx.context(probe, receiver);
    fx.interp.memory.release_in_hand(probe);
    fx.interp.memory.release_in_hand(receiver);
    fx.interp.new_active_context(context);
    fx.interp.memory.release_in_hand(context);

    fx.run_steps(2); // push the array, send #bogus -> doesNotUnderstand: activates
    fx.run_steps(2); // push the message argument, return it
    let message = top(&fx.interp);
    assert_eq!(fx.memory().fetch_class_of(message), fx.class_message);
    assert_eq!(
        fx.memory().fetch_pointer(MESSAGE_SELECTOR_INDEX, message),
        fx.sym_bogus
    );
    let arguments = fx.memory().fetch_pointer(MESSAGE_ARGUMENTS_INDEX, message);
    assert_eq!(fx.memory().fetch_class_of(arguments), fx.class_array);
    assert_eq!(fx.memory().word_length_of(arguments), 0);
}

#[test]
fn non_boolean_jump_sends_must_be_boolean() {
    let classic = Tagging::Classic;
    let mut fx = fixture(&[classic.integer_object_of(5)], &[32, 152, 120]);
    let answer_self = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: None,
            literals: &[],
            bytecodes: &[120],
        },
    );
    let must_be_boolean = fx.memory().wk.selector_must_be_boolean;
    fx.install(fx.class_object, must_be_boolean, answer_self);

    let main = fx.main_context;
    fx.run_steps(2);
    assert_eq!(fx.interp.stats.sends(), 1);
    assert_ne!(fx.interp.active_context, main);
    // The culprit became the receiver of mustBeBoolean.
    assert_eq!(fx.interp.receiver, int(fx.memory(), 5));
}

#[test]
fn signaling_wakes_the_higher_priority_waiter() {
    let mut fx = fixture(&[], &[120]);
    let semaphore = fx.semaphore();
    let sym_signal = fx.sym_signal;
    let signal_method = fx.method(
        fx.class_semaphore,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: Some(85),
            literals: &[],
            bytecodes: &[120],
        },
    );
    fx.install(fx.class_semaphore, sym_signal, signal_method);

    // A high-priority process blocked on the semaphore.
    let idle = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: None,
            literals: &[],
            bytecodes: &[120],
        },
    );
    let waiter_receiver = fx
        .interp
        .memory
        .instantiate_class_with_pointers(fx.class_object, 0)
        .unwrap();
    let waiter_context = fx.context(idle, waiter_receiver);
    fx.interp.memory.release_in_hand(idle);
    fx.interp.memory.release_in_hand(waiter_receiver);
    let waiter = fx.process(waiter_context, 6);
    fx.interp.memory.release_in_hand(waiter_context);
    fx.enqueue_process(semaphore, waiter);
    fx.interp.memory.release_in_hand(waiter);

    // The running (priority 4) program: sem signal.
    let program = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: None,
            literals: &[semaphore, sym_signal],
            bytecodes: &[32, 209, 124],
        },
    );
    fx.interp.memory.release_in_hand(semaphore);
    let main_receiver = fx
        .interp
        .memory
        .instantiate_class_with_pointers(fx.class_object, 0)
        .unwrap();
    let context = fx.context(program, main_receiver);
    fx.interp.memory.release_in_hand(program);
    fx.interp.memory.release_in_hand(main_receiver);
    fx.interp.new_active_context(context);
    fx.interp.memory.release_in_hand(context);

    fx.run_steps(2); // push sem, send signal (primitive 85)
    fx.interp.check_process_switch().expect("switch");

    assert_eq!(fx.active_process(), waiter);
    assert_eq!(fx.interp.active_context, waiter_context);
    // The preempted process went to the back of its run queue.
    let queue = fx.run_queue(4);
    assert_eq!(
        fx.memory().fetch_pointer(FIRST_LINK_INDEX, queue),
        fx.main_process
    );
    // Invariant: nothing ready outranks the active process.
    let active_priority = fx
        .memory()
        .integer_value_of(fx.memory().fetch_pointer(PRIORITY_INDEX, fx.active_process()));
    for priority in 1..=8usize {
        let list = fx.run_queue(priority);
        let nil = fx.memory().wk.nil;
        if fx.memory().fetch_pointer(FIRST_LINK_INDEX, list) != nil {
            assert!(priority as i16 <= active_priority);
        }
    }
}

#[test]
fn signaling_an_empty_semaphore_accumulates_excess() {
    let mut fx = fixture(&[], &[120]);
    let semaphore = fx.semaphore();
    let sym_signal = fx.sym_signal;
    let signal_method = fx.method(
        fx.class_semaphore,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: Some(85),
            literals: &[],
            bytecodes: &[120],
        },
    );
    fx.install(fx.class_semaphore, sym_signal, signal_method);
    let program = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 0,
            temporaries: 0,
            primitive: None,
            literals: &[semaphore, sym_signal],
            bytecodes: &[32, 209, 124],
        },
    );
    fx.interp.memory.release_in_hand(semaphore);
    let receiver = fx
        .interp
        .memory
        .instantiate_class_with_pointers(fx.class_object, 0)
        .unwrap();
    let context = fx.context(program, receiver);
    fx.interp.memory.release_in_hand(program);
    fx.interp.memory.release_in_hand(receiver);
    fx.interp.new_active_context(context);
    fx.interp.memory.release_in_hand(context);

    fx.run_steps(2);
    let excess = fx
        .memory()
        .integer_value_of(fx.memory().fetch_pointer(EXCESS_SIGNALS_INDEX, semaphore));
    assert_eq!(excess, 1);
    assert!(fx.interp.check_process_switch().is_ok());
    assert_eq!(fx.active_process(), fx.main_process);
}

#[test]
fn input_events_queue_and_signal_the_input_semaphore() {
    let mut fx = fixture(&[], &[120]);
    let semaphore = fx.semaphore();
    fx.interp.input_semaphore = semaphore;
    fx.interp.memory.release_in_hand(semaphore);
    let mut vm = Vm { interpreter: fx.interp };
    vm.input_event(0x3041);
    vm.input_event(0x4041);
    vm.interpreter.check_process_switch().expect("drain");
    assert_eq!(vm.interpreter.input_queue.len(), 2);
    assert_eq!(vm.interpreter.input_queue[0], 0x3041);
    assert_eq!(vm.interpreter.input_queue[1], 0x4041);
    let excess = vm.interpreter.memory.integer_value_of(
        vm.interpreter
            .memory
            .fetch_pointer(EXCESS_SIGNALS_INDEX, semaphore),
    );
    assert_eq!(excess, 2, "one signal per event word");
}

#[test]
fn snapshot_round_trip_resumes_identically() {
    let classic = Tagging::Classic;
    let mut fx = fixture(
        &[classic.integer_object_of(3), classic.integer_object_of(4)],
        &[32, 33, 176, 124],
    );
    fx.run_steps(1); // one push executed, two meaningful bytecodes to go

    let dir = std::env::temp_dir().join("st80-vm-roundtrip");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("resume.im");
    let mut vm = Vm { interpreter: fx.interp };
    vm.set_snapshot_filename(path.clone());
    vm.save_snapshot().expect("snapshot");

    // The original continues...
    vm.interpreter.step().expect("step");
    vm.interpreter.step().expect("step");
    let original = top(&vm.interpreter);

    // ...and so does the reloaded copy, to the same answer.
    let memory = snapshot::load_image(&path).expect("reload");
    let mut resumed = Interpreter::new(memory, Bridges::loopback());
    resumed.boot().expect("boot");
    resumed.step().expect("step");
    resumed.step().expect("step");
    assert_eq!(top(&resumed), original);
    assert_eq!(top(&resumed), resumed.memory.integer_object_of(7));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn reference_counts_agree_with_reachable_slots_after_collection() {
    let classic = Tagging::Classic;
    let mut fx = fixture(
        &[classic.integer_object_of(3), classic.integer_object_of(4)],
        &[32, 33, 176, 124],
    );
    fx.run_steps(3);
    let mut vm = Vm { interpreter: fx.interp };
    // A snapshot save runs a full collection with the interpreter's roots.
    let dir = std::env::temp_dir().join("st80-vm-counts");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("counts.im");
    vm.set_snapshot_filename(path.clone());
    vm.save_snapshot().expect("snapshot");
    std::fs::remove_file(&path).unwrap();

    let interp = &vm.interpreter;
    let memory = &interp.memory;
    // Tally every slot naming every object, the way the collector does.
    let mut expected = std::collections::HashMap::<u16, u32>::new();
    let note = |oop: u16, expected: &mut std::collections::HashMap<u16, u32>| {
        if oop != 0
            && !memory.is_integer_object(oop)
            && oop != memory.wk.nil
            && memory.has_object(oop)
        {
            *expected.entry(oop).or_insert(0) += 1;
        }
    };
    for candidate in 0..=0xFFFFu32 {
        let oop = candidate as u16;
        if memory.is_integer_object(oop) || !memory.has_object(oop) {
            continue;
        }
        note(memory.fetch_class_of(oop), &mut expected);
        if memory.pointer_fields_of(oop) {
            for index in 0..memory.word_length_of(oop) {
                note(memory.fetch_pointer(index, oop), &mut expected);
            }
        } else if memory.fetch_class_of(oop) == memory.wk.class_compiled_method {
            let header = memory.fetch_pointer(0, oop);
            let literals =
                Tagging::Classic.literal_count_of(memory.integer_value_of(header) as u16);
            for index in 1..=literals {
                note(memory.fetch_pointer(index, oop), &mut expected);
            }
        }
    }
    // Register roots hold one count each.
    for root in [
        interp.active_context,
        interp.home_context,
        interp.method,
        interp.receiver,
        interp.message_selector,
        interp.new_method,
        interp.input_semaphore,
    ] {
        note(root, &mut expected);
    }

    for candidate in 0..=0xFFFFu32 {
        let oop = candidate as u16;
        if memory.is_integer_object(oop) || !memory.has_object(oop) {
            continue;
        }
        let count = memory.count_of(oop);
        if count == 127 || oop == memory.wk.nil {
            continue;
        }
        let slots = expected.get(&oop).copied().unwrap_or(0);
        assert_eq!(
            count as u32, slots,
            "count of {:04x} disagrees with its {} referencing slots",
            oop, slots
        );
    }
}
