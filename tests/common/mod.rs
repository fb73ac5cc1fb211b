// A miniature classic-tagging image built through the public API: just enough
// classes, selectors, methods and scheduler furniture to drive the interpreter
// the way a real snapshot would.

use st80::interpreter::{
    Bridges, Interpreter, IP_INDEX, LITERAL_START, METHOD_INDEX, RECEIVER_INDEX, SP_INDEX,
    TEMP_FRAME_START, VALUE_INDEX,
};
use st80::memory::ObjectMemory;
use st80::oops::{Oop, Tagging, UNUSED};
use st80::scheduler::{
    ACTIVE_PROCESS_INDEX, EXCESS_SIGNALS_INDEX, FIRST_LINK_INDEX, LAST_LINK_INDEX,
    PRIORITY_INDEX, PROCESS_LISTS_INDEX, SUSPENDED_CONTEXT_INDEX,
};

// Classic instance-specification bits.
pub const SPEC_POINTERS: u16 = 0x4000;
pub const SPEC_WORDS: u16 = 0x2000;
pub const SPEC_INDEXABLE: u16 = 0x1000;

pub struct Fixture {
    pub interp: Interpreter,
    pub class_object: Oop,
    pub class_array: Oop,
    pub class_string: Oop,
    pub class_symbol: Oop,
    pub class_small_integer: Oop,
    pub class_large_positive_integer: Oop,
    pub class_method_context: Oop,
    pub class_block_context: Oop,
    pub class_point: Oop,
    pub class_message: Oop,
    pub class_semaphore: Oop,
    pub class_compiled_method: Oop,
    pub class_process: Oop,
    pub class_linked_list: Oop,
    pub scheduler: Oop,
    pub main_process: Oop,
    pub main_context: Oop,
    pub sym_times: Oop,
    pub sym_bogus: Oop,
    pub sym_signal: Oop,
}

pub fn int(memory: &ObjectMemory, value: i32) -> Oop {
    memory.integer_object_of(value as i16)
}

pub fn top(interp: &Interpreter) -> Oop {
    interp
        .memory
        .fetch_pointer(interp.stack_pointer, interp.active_context)
}

/// Assembles a compiled-method header for the classic scheme.
pub fn header(flag: u16, temporaries: u16, large: bool, literals: u16) -> u16 {
    (flag << 12) | (temporaries << 7) | ((large as u16) << 6) | literals
}

pub struct MethodSpec<'a> {
    pub argument_count: usize,
    pub temporaries: usize,
    pub primitive: Option<u16>,
    pub literals: &'a [Oop],
    pub bytecodes: &'a [u8],
}

impl Fixture {
    pub fn memory(&self) -> &ObjectMemory {
        &self.interp.memory
    }

    fn alloc_pointers(&mut self, class: Oop, length: usize) -> Oop {
        self.interp
            .memory
            .instantiate_class_with_pointers(class, length)
            .expect("fixture allocation")
    }

    /// A message dictionary with its parallel method array; returned in hand.
    fn dictionary(&mut self, capacity: usize) -> Oop {
        let class_array = self.class_array;
        let memory = &mut self.interp.memory;
        let methods = memory
            .instantiate_class_with_pointers(class_array, capacity)
            .expect("fixture allocation");
        let dictionary = memory
            .instantiate_class_with_pointers(class_array, 2 + capacity)
            .expect("fixture allocation");
        memory.store_pointer(1, dictionary, methods);
        memory.release_in_hand(methods);
        dictionary
    }

    /// A class object: superclass, message dictionary, instance specification.
    /// Returned in hand; callers anchor or pin it.
    pub fn class(&mut self, superclass: Oop, spec: u16, fixed: u16, capacity: usize) -> Oop {
        let dictionary = self.dictionary(capacity);
        let class_object = self.class_object;
        let memory = &mut self.interp.memory;
        let class = memory
            .instantiate_class_with_pointers(class_object, 3)
            .expect("fixture allocation");
        memory.store_pointer(0, class, superclass);
        memory.store_pointer(1, class, dictionary);
        let spec = int(memory, (spec | fixed) as i32);
        memory.store_pointer(2, class, spec);
        memory.release_in_hand(dictionary);
        class
    }

    fn pinned_class(&mut self, superclass: Oop, spec: u16, fixed: u16) -> Oop {
        let class = self.class(superclass, spec, fixed, 8);
        self.interp.memory.pin(class);
        self.interp.memory.release_in_hand(class);
        class
    }

    /// Fills one of the bootstrapped fixed-pointer class shells.
    fn fill_shell(&mut self, class_oop: Oop, spec: u16, fixed: u16) {
        let dictionary = self.dictionary(8);
        let class_object = self.class_object;
        let memory = &mut self.interp.memory;
        memory.store_pointer(0, class_oop, class_object);
        memory.store_pointer(1, class_oop, dictionary);
        let spec = int(memory, (spec | fixed) as i32);
        memory.store_pointer(2, class_oop, spec);
        memory.release_in_hand(dictionary);
    }

    /// Interns a selector: a pinned byte object of the symbol class.
    pub fn symbol(&mut self, name: &str) -> Oop {
        let class_symbol = self.class_symbol;
        let memory = &mut self.interp.memory;
        let symbol = memory
            .instantiate_class_with_bytes(class_symbol, name.len())
            .expect("fixture allocation");
        for (index, byte) in name.bytes().enumerate() {
            memory.store_byte(index, symbol, byte);
        }
        memory.pin(symbol);
        memory.release_in_hand(symbol);
        symbol
    }

    /// Builds a compiled method. Two hidden literals are always appended: the
    /// header extension and the method-class association super sends consult.
    /// Returned in hand.
    pub fn method(&mut self, holder: Oop, spec: MethodSpec) -> Oop {
        let literal_count = spec.literals.len() + 2;
        let flag: u16 = if spec.primitive.is_some() {
            7
        } else {
            spec.argument_count as u16
        };
        let temporaries = (spec.argument_count + spec.temporaries) as u16;
        let header_value = header(flag, temporaries, false, literal_count as u16);
        let class_compiled_method = self.class_compiled_method;
        let class_object = self.class_object;
        let memory = &mut self.interp.memory;
        let extension = int(
            memory,
            ((spec.argument_count as i32) << 8) | spec.primitive.unwrap_or(0) as i32,
        );

        let total_bytes = (literal_count + 1) * 2 + spec.bytecodes.len();
        let method = memory
            .instantiate_class_with_bytes(class_compiled_method, total_bytes)
            .expect("fixture allocation");
        let header_oop = int(memory, header_value as i32);
        memory.store_word(0, method, header_oop);
        for (index, &literal) in spec.literals.iter().enumerate() {
            memory.store_pointer(LITERAL_START + index, method, literal);
        }
        memory.store_pointer(LITERAL_START + literal_count - 2, method, extension);
        let association = memory
            .instantiate_class_with_pointers(class_object, 2)
            .expect("fixture allocation");
        memory.store_pointer(VALUE_INDEX, association, holder);
        memory.store_pointer(LITERAL_START + literal_count - 1, method, association);
        memory.release_in_hand(association);
        let bytecode_base = (literal_count + 1) * 2;
        for (index, &byte) in spec.bytecodes.iter().enumerate() {
            memory.store_byte(bytecode_base + index, method, byte);
        }
        method
    }

    /// Installs a method under a selector in a class's open-addressed message
    /// dictionary; consumes the method's in-hand reference.
    pub fn install(&mut self, class: Oop, selector: Oop, method: Oop) {
        let memory = &mut self.interp.memory;
        let dictionary = memory.fetch_pointer(1, class);
        let methods = memory.fetch_pointer(1, dictionary);
        let length = memory.word_length_of(dictionary);
        let slots = length - 2;
        let nil = memory.wk.nil;
        let mut index = 2 + Tagging::Classic.linear_of(selector) % slots;
        loop {
            if memory.fetch_pointer(index, dictionary) == nil {
                memory.store_pointer(index, dictionary, selector);
                memory.store_pointer(index - 2, methods, method);
                memory.release_in_hand(method);
                return;
            }
            index += 1;
            if index == length {
                index = 2;
            }
        }
    }

    /// A fresh method context ready to run `method` with the given receiver;
    /// returned in hand.
    pub fn context(&mut self, method: Oop, receiver: Oop) -> Oop {
        let literal_count = {
            let header = self.interp.memory.fetch_pointer(0, method);
            let value = self.interp.memory.integer_value_of(header) as u16;
            Tagging::Classic.literal_count_of(value)
        };
        let class_method_context = self.class_method_context;
        let memory = &mut self.interp.memory;
        let context = memory
            .instantiate_class_with_pointers(class_method_context, TEMP_FRAME_START + 12)
            .expect("fixture allocation");
        let initial_ip = int(memory, ((literal_count + 1) * 2 + 1) as i32);
        memory.store_pointer(IP_INDEX, context, initial_ip);
        memory.store_pointer(SP_INDEX, context, int(memory, 0));
        memory.store_pointer(METHOD_INDEX, context, method);
        memory.store_pointer(RECEIVER_INDEX, context, receiver);
        context
    }

    /// A process of the given priority suspended on `context`; returned in hand.
    pub fn process(&mut self, context: Oop, priority: i32) -> Oop {
        let class = self.class_process;
        let memory = &mut self.interp.memory;
        let process = memory
            .instantiate_class_with_pointers(class, 4)
            .expect("fixture allocation");
        memory.store_pointer(SUSPENDED_CONTEXT_INDEX, process, context);
        memory.store_pointer(PRIORITY_INDEX, process, int(memory, priority));
        process
    }

    /// A semaphore with no waiters and no excess signals; returned in hand.
    pub fn semaphore(&mut self) -> Oop {
        let class = self.class_semaphore;
        let memory = &mut self.interp.memory;
        let semaphore = memory
            .instantiate_class_with_pointers(class, 3)
            .expect("fixture allocation");
        memory.store_pointer(EXCESS_SIGNALS_INDEX, semaphore, int(memory, 0));
        semaphore
    }

    /// Appends a process to a semaphore's (or run queue's) linked list.
    pub fn enqueue_process(&mut self, list: Oop, process: Oop) {
        let memory = &mut self.interp.memory;
        let nil = memory.wk.nil;
        if memory.fetch_pointer(FIRST_LINK_INDEX, list) == nil {
            memory.store_pointer(FIRST_LINK_INDEX, list, process);
        } else {
            let last = memory.fetch_pointer(LAST_LINK_INDEX, list);
            memory.store_pointer(0, last, process);
        }
        memory.store_pointer(LAST_LINK_INDEX, list, process);
    }

    pub fn run_queue(&self, priority: usize) -> Oop {
        let memory = self.memory();
        let scheduler = memory.fetch_pointer(VALUE_INDEX, memory.wk.scheduler_association);
        let lists = memory.fetch_pointer(PROCESS_LISTS_INDEX, scheduler);
        memory.fetch_pointer(priority - 1, lists)
    }

    pub fn active_process(&self) -> Oop {
        let memory = self.memory();
        let scheduler = memory.fetch_pointer(VALUE_INDEX, memory.wk.scheduler_association);
        memory.fetch_pointer(ACTIVE_PROCESS_INDEX, scheduler)
    }

    pub fn run_steps(&mut self, count: usize) {
        for _ in 0..count {
            self.interp.step().expect("bytecode step");
        }
    }
}

/// Builds the world. The returned interpreter has booted: its registers hold
/// the main context, which runs `main_bytecodes` over `main_literals`.
pub fn fixture(main_literals: &[Oop], main_bytecodes: &[u8]) -> Fixture {
    let mut memory = ObjectMemory::new(Tagging::Classic);
    let wk = memory.wk.clone();

    // The immutable furniture at its fixed pointers. Classes get shells here
    // and real contents once Object exists.
    memory.bootstrap_object(wk.nil, UNUSED, true, false, 0);
    memory.pin(wk.nil);
    memory.bootstrap_object(wk.true_oop, UNUSED, true, false, 0);
    memory.pin(wk.true_oop);
    memory.bootstrap_object(wk.false_oop, UNUSED, true, false, 0);
    memory.pin(wk.false_oop);
    for class_oop in [
        wk.class_small_integer,
        wk.class_string,
        wk.class_array,
        wk.class_float,
        wk.class_method_context,
        wk.class_block_context,
        wk.class_point,
        wk.class_large_positive_integer,
        wk.class_semaphore,
        wk.class_message,
        wk.class_character,
    ] {
        memory.bootstrap_object(class_oop, UNUSED, true, false, 3);
        memory.pin(class_oop);
    }
    memory.bootstrap_object(wk.special_selectors, UNUSED, true, false, 64);
    memory.pin(wk.special_selectors);
    memory.bootstrap_object(wk.character_table, UNUSED, true, false, 256);
    memory.pin(wk.character_table);
    memory.bootstrap_object(wk.scheduler_association, UNUSED, true, false, 2);
    memory.pin(wk.scheduler_association);

    let mut fx = Fixture {
        interp: Interpreter::new(memory, Bridges::loopback()),
        class_object: UNUSED,
        class_array: wk.class_array,
        class_string: wk.class_string,
        class_symbol: UNUSED,
        class_small_integer: wk.class_small_integer,
        class_large_positive_integer: wk.class_large_positive_integer,
        class_method_context: wk.class_method_context,
        class_block_context: wk.class_block_context,
        class_point: wk.class_point,
        class_message: wk.class_message,
        class_semaphore: wk.class_semaphore,
        class_compiled_method: UNUSED,
        class_process: UNUSED,
        class_linked_list: UNUSED,
        scheduler: UNUSED,
        main_process: UNUSED,
        main_context: UNUSED,
        sym_times: UNUSED,
        sym_bogus: UNUSED,
        sym_signal: UNUSED,
    };
    let nil = wk.nil;

    // Object, root of every superclass chain.
    fx.class_object = fx.pinned_class(nil, SPEC_POINTERS, 0);

    // Flesh out the fixed-pointer shells.
    fx.fill_shell(wk.class_small_integer, 0, 0);
    fx.fill_shell(wk.class_string, SPEC_INDEXABLE, 0);
    fx.fill_shell(wk.class_array, SPEC_POINTERS | SPEC_INDEXABLE, 0);
    fx.fill_shell(wk.class_float, SPEC_WORDS | SPEC_INDEXABLE, 0);
    fx.fill_shell(wk.class_method_context, SPEC_POINTERS | SPEC_INDEXABLE, 6);
    fx.fill_shell(wk.class_block_context, SPEC_POINTERS | SPEC_INDEXABLE, 6);
    fx.fill_shell(wk.class_point, SPEC_POINTERS, 2);
    fx.fill_shell(wk.class_large_positive_integer, SPEC_INDEXABLE, 0);
    fx.fill_shell(wk.class_semaphore, SPEC_POINTERS, 3);
    fx.fill_shell(wk.class_message, SPEC_POINTERS, 2);
    fx.fill_shell(wk.class_character, SPEC_POINTERS, 1);

    // Supporting classes without fixed pointers.
    fx.class_symbol = fx.pinned_class(fx.class_object, SPEC_INDEXABLE, 0);
    fx.class_compiled_method = fx.pinned_class(fx.class_object, SPEC_INDEXABLE, 0);
    fx.class_process = fx.pinned_class(fx.class_object, SPEC_POINTERS, 4);
    fx.class_linked_list = fx.pinned_class(fx.class_object, SPEC_POINTERS, 2);

    // The fixed selectors are symbols at fixed pointers.
    {
        let class_symbol = fx.class_symbol;
        let memory = &mut fx.interp.memory;
        for (selector, name) in [
            (wk.selector_does_not_understand, "doesNotUnderstand:"),
            (wk.selector_cannot_return, "cannotReturn:"),
            (wk.selector_must_be_boolean, "mustBeBoolean"),
        ] {
            memory.bootstrap_object(
                selector,
                class_symbol,
                false,
                name.len() & 1 == 1,
                (name.len() + 1) / 2,
            );
            for (index, byte) in name.bytes().enumerate() {
                memory.store_byte(index, selector, byte);
            }
            memory.pin(selector);
        }
    }

    fx.sym_times = fx.symbol("*");
    fx.sym_bogus = fx.symbol("bogus");
    fx.sym_signal = fx.symbol("signal");

    // The special-selector table: (selector, argument count) pairs. Only the
    // slots the tests exercise get real selectors.
    {
        let sym_times = fx.sym_times;
        let memory = &mut fx.interp.memory;
        let table = wk.special_selectors;
        for index in 0..32 {
            let filler = int(memory, 0);
            memory.store_word(2 * index + 1, table, filler);
        }
        memory.store_pointer(2 * 8, table, sym_times);
        let one = int(memory, 1);
        memory.store_pointer(2 * 8 + 1, table, one);
    }

    // Scheduler furniture: eight run queues, one active process.
    let lists = fx.alloc_pointers(fx.class_array, 8);
    for priority in 0..8 {
        let list = fx.alloc_pointers(fx.class_linked_list, 2);
        fx.interp.memory.store_pointer(priority, lists, list);
        fx.interp.memory.release_in_hand(list);
    }
    fx.scheduler = fx.alloc_pointers(fx.class_object, 2);
    {
        let (scheduler, lists) = (fx.scheduler, lists);
        let memory = &mut fx.interp.memory;
        memory.store_pointer(PROCESS_LISTS_INDEX, scheduler, lists);
        memory.release_in_hand(lists);
        memory.store_pointer(VALUE_INDEX, wk.scheduler_association, scheduler);
        memory.release_in_hand(scheduler);
    }

    // The main method, its context and its process.
    let main_method = fx.method(
        fx.class_object,
        MethodSpec {
            argument_count: 0,
            temporaries: 4,
            primitive: None,
            literals: main_literals,
            bytecodes: main_bytecodes,
        },
    );
    let receiver = fx.alloc_pointers(fx.class_object, 0);
    fx.main_context = fx.context(main_method, receiver);
    fx.main_process = fx.process(fx.main_context, 4);
    {
        let (process, context, method, receiver) =
            (fx.main_process, fx.main_context, main_method, receiver);
        let scheduler = fx.scheduler;
        let memory = &mut fx.interp.memory;
        memory.store_pointer(ACTIVE_PROCESS_INDEX, scheduler, process);
        memory.release_in_hand(process);
        memory.release_in_hand(context);
        memory.release_in_hand(method);
        memory.release_in_hand(receiver);
    }

    fx.interp.boot().expect("boot");
    fx
}
