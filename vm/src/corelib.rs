//! The built-in class skeleton every snapshot carries: the root class
//! with the default `noSuchMethod`, the boxed-number and collection
//! method tables wired to natives (with overflow fallbacks), the
//! coroutine start protocol, ports, and the static helpers programs
//! call into.

use bytecode::{BytecodeWriter, Op};
use object::{Selector, TypeTag};

use crate::natives::Native;
use crate::snapshot::{
    ClassDesc, FunctionDesc, Literal, ProgramBuilder, SpecialRoles,
};

/// Indices into the snapshot under construction, handed to tooling and
/// tests so they can reference the core pieces.
pub struct CoreLibrary {
    pub object_class: usize,
    pub meta_class: usize,
    pub null_class: usize,
    pub bool_class: usize,
    pub smi_class: usize,
    pub large_integer_class: usize,
    pub double_class: usize,
    pub string_class: usize,
    pub array_class: usize,
    pub byte_array_class: usize,
    pub boxed_class: usize,
    pub stack_class: usize,
    pub coroutine_class: usize,
    pub function_class: usize,
    pub initializer_class: usize,
    pub port_class: usize,
    pub sentinel_class: usize,
    pub error_class: usize,
    pub spawn_entry_class: usize,

    /// Constant: the immutable spawn-entry instance passed to
    /// `Process._spawn`.
    pub spawn_entry_constant: usize,

    // Static method table indices.
    pub print_static: usize,
    pub gc_static: usize,
    pub array_new_static: usize,
    pub process_spawn_static: usize,
    pub receive_static: usize,
    pub port_create_static: usize,
    pub coroutine_new_static: usize,
    pub coroutine_current_static: usize,
    pub link_port_static: usize,
    pub is_immutable_static: usize,
    pub stopwatch_now_static: usize,
}

impl CoreLibrary {
    pub fn method_selector(builder: &mut ProgramBuilder, name: &str, arity: u8) -> Selector {
        Selector::method(builder.intern(name), arity)
    }
}

fn instance_class(superclass: usize) -> ClassDesc {
    ClassDesc {
        type_tag: TypeTag::Instance,
        fields: 0,
        superclass: Some(superclass),
        methods: Vec::new(),
    }
}

fn typed_class(type_tag: TypeTag, superclass: usize) -> ClassDesc {
    ClassDesc { type_tag, fields: 0, superclass: Some(superclass), methods: Vec::new() }
}

/// A method whose body is one native with a throwing fallback.
fn native_method(native: Native, arity: u8) -> FunctionDesc {
    let mut w = BytecodeWriter::new();
    w.op_u8_u8(Op::InvokeNative, arity + 1, native as u8);
    w.op(Op::Throw);
    FunctionDesc {
        arity: arity as usize + 1,
        literals: Vec::new(),
        catch_ranges: Vec::new(),
        code: w.finish(),
    }
}

/// A smi method: try the smi native, fall back to the integer native
/// (LargeInteger arithmetic and overflow), then throw.
fn smi_method(fast: Native, fallback: Native, arity: u8) -> FunctionDesc {
    let mut w = BytecodeWriter::new();
    w.op_u8_u8(Op::InvokeNative, arity + 1, fast as u8);
    w.op(Op::Pop); // discard the reified failure of the fast native
    w.op_u8_u8(Op::InvokeNative, arity + 1, fallback as u8);
    w.op(Op::Throw);
    FunctionDesc {
        arity: arity as usize + 1,
        literals: Vec::new(),
        catch_ranges: Vec::new(),
        code: w.finish(),
    }
}

/// A static helper whose body is one native with a throwing fallback;
/// callers pass a leading null placeholder as the receiver slot.
fn native_static(native: Native, arity: usize) -> FunctionDesc {
    let mut w = BytecodeWriter::new();
    w.op_u8_u8(Op::InvokeNative, arity as u8, native as u8);
    w.op(Op::Throw);
    FunctionDesc {
        arity,
        literals: Vec::new(),
        catch_ranges: Vec::new(),
        code: w.finish(),
    }
}

/// Install the core into an empty builder.
pub fn install_core(builder: &mut ProgramBuilder) -> CoreLibrary {
    // The runtime pins ids for these three names; keep them first.
    assert_eq!(builder.intern("noSuchMethod"), crate::interning::NO_SUCH_METHOD_ID);
    assert_eq!(builder.intern("call"), crate::interning::CALL_ID);
    assert_eq!(builder.intern("coroutineStart"), crate::interning::COROUTINE_START_ID);

    // ── Classes ────────────────────────────────────────────────────
    let object_class = builder.add_class(ClassDesc {
        type_tag: TypeTag::Instance,
        fields: 0,
        superclass: None,
        methods: Vec::new(),
    });
    let meta_class = builder.add_class(typed_class(TypeTag::Class, object_class));
    let null_class = builder.add_class(instance_class(object_class));
    let bool_class = builder.add_class(instance_class(object_class));
    let smi_class = builder.add_class(instance_class(object_class));
    let large_integer_class =
        builder.add_class(typed_class(TypeTag::LargeInteger, object_class));
    let double_class = builder.add_class(typed_class(TypeTag::Double, object_class));
    let string_class = builder.add_class(typed_class(TypeTag::Str, object_class));
    let array_class = builder.add_class(typed_class(TypeTag::Array, object_class));
    let byte_array_class =
        builder.add_class(typed_class(TypeTag::ByteArray, object_class));
    let boxed_class = builder.add_class(typed_class(TypeTag::Boxed, object_class));
    let stack_class = builder.add_class(typed_class(TypeTag::Stack, object_class));
    let coroutine_class =
        builder.add_class(typed_class(TypeTag::Coroutine, object_class));
    let function_class =
        builder.add_class(typed_class(TypeTag::Function, object_class));
    let initializer_class =
        builder.add_class(typed_class(TypeTag::Initializer, object_class));
    let port_class = builder.add_class(instance_class(object_class));
    let sentinel_class = builder.add_class(instance_class(object_class));
    let error_class = builder.add_class(instance_class(object_class));
    let spawn_entry_class = builder.add_class(instance_class(object_class));

    // ── The noSuchMethod trampoline ────────────────────────────────
    //
    // Entered from a failed dispatch with the site's return address on
    // top of the stack. The getter path goes through two late-bound
    // sends; the plain path invokes `noSuchMethod(selector)`.
    let no_such_method_selector =
        Selector::method(crate::interning::NO_SUCH_METHOD_ID, 1);
    let trampoline = {
        let mut w = BytecodeWriter::new();
        w.op_u8(Op::EnterNoSuchMethod, 13);
        w.op_i32(Op::InvokeSelector, 0); // getter
        w.op_i32(Op::InvokeSelector, 0); // call
        w.op(Op::ExitNoSuchMethod);
        w.op_i32(Op::InvokeMethod, no_such_method_selector.raw() as i32); // at 13
        w.op(Op::ExitNoSuchMethod);
        builder.add_function(FunctionDesc {
            arity: 1,
            literals: Vec::new(),
            catch_ranges: Vec::new(),
            code: w.finish(),
        })
    };
    builder.trampoline = trampoline;

    // Default `noSuchMethod` on the root class: throw a fresh error.
    let no_such_method_error = Literal::Instance {
        class: error_class,
        immutable: true,
        fields: Vec::new(),
    };
    let default_no_such_method = {
        let mut w = BytecodeWriter::new();
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        builder.add_function(FunctionDesc {
            arity: 2,
            literals: vec![no_such_method_error],
            catch_ranges: Vec::new(),
            code: w.finish(),
        })
    };
    builder.add_method(object_class, no_such_method_selector, default_no_such_method);

    // ── Smi / integer / double method tables ───────────────────────
    let binary_table: &[(&str, Native, Native)] = &[
        ("+", Native::SmiAdd, Native::IntAdd),
        ("-", Native::SmiSub, Native::IntSub),
        ("*", Native::SmiMul, Native::IntMul),
        ("%", Native::SmiMod, Native::IntMod),
        ("~/", Native::SmiTruncDiv, Native::IntTruncDiv),
        ("&", Native::SmiBitAnd, Native::IntBitAnd),
        ("|", Native::SmiBitOr, Native::IntBitOr),
        ("^", Native::SmiBitXor, Native::IntBitXor),
        (">>", Native::SmiBitShr, Native::IntBitShr),
        ("<<", Native::SmiBitShl, Native::IntBitShl),
        ("==", Native::SmiEqual, Native::IntEqual),
        ("<", Native::SmiLess, Native::IntLess),
        ("<=", Native::SmiLessEqual, Native::IntLessEqual),
        (">", Native::SmiGreater, Native::IntGreater),
        (">=", Native::SmiGreaterEqual, Native::IntGreaterEqual),
    ];
    for &(name, fast, fallback) in binary_table {
        let selector = Selector::method(builder.intern(name), 1);
        let smi_fn = builder.add_function(smi_method(fast, fallback, 1));
        builder.add_method(smi_class, selector, smi_fn);
        let int_fn = builder.add_function(native_method(fallback, 1));
        builder.add_method(large_integer_class, selector, int_fn);
    }
    {
        let selector = Selector::method(builder.intern("~"), 0);
        let smi_fn =
            builder.add_function(smi_method(Native::SmiBitNot, Native::IntBitNot, 0));
        builder.add_method(smi_class, selector, smi_fn);
        let int_fn = builder.add_function(native_method(Native::IntBitNot, 0));
        builder.add_method(large_integer_class, selector, int_fn);

        let to_double = Selector::method(builder.intern("toDouble"), 0);
        let smi_fn = builder.add_function(native_method(Native::SmiToDouble, 0));
        builder.add_method(smi_class, to_double, smi_fn);
    }

    let double_table: &[(&str, Native)] = &[
        ("+", Native::DoubleAdd),
        ("-", Native::DoubleSub),
        ("*", Native::DoubleMul),
        ("/", Native::DoubleDiv),
        ("%", Native::DoubleMod),
        ("==", Native::DoubleEqual),
        ("<", Native::DoubleLess),
        ("<=", Native::DoubleLessEqual),
        (">", Native::DoubleGreater),
        (">=", Native::DoubleGreaterEqual),
    ];
    for &(name, native) in double_table {
        let selector = Selector::method(builder.intern(name), 1);
        let function = builder.add_function(native_method(native, 1));
        builder.add_method(double_class, selector, function);
    }
    {
        let selector = Selector::method(builder.intern("isNaN"), 0);
        let function = builder.add_function(native_method(Native::DoubleIsNaN, 0));
        builder.add_method(double_class, selector, function);
    }

    // ── Strings and arrays ─────────────────────────────────────────
    {
        let length = Selector::method(builder.intern("length"), 0);
        let function = builder.add_function(native_method(Native::StringLength, 0));
        builder.add_method(string_class, length, function);
        let function = builder.add_function(native_method(Native::ArrayLength, 0));
        builder.add_method(array_class, length, function);

        let eq = Selector::method(builder.intern("=="), 1);
        let function = builder.add_function(native_method(Native::StringEqual, 1));
        builder.add_method(string_class, eq, function);

        let plus = Selector::method(builder.intern("+"), 1);
        let function = builder.add_function(native_method(Native::StringAdd, 1));
        builder.add_method(string_class, plus, function);

        let code_unit = Selector::method(builder.intern("codeUnitAt"), 1);
        let function =
            builder.add_function(native_method(Native::StringCodeUnitAt, 1));
        builder.add_method(string_class, code_unit, function);

        let index_get = Selector::method(builder.intern("[]"), 1);
        let function =
            builder.add_function(native_method(Native::ArrayIndexGet, 1));
        builder.add_method(array_class, index_get, function);

        let index_set = Selector::method(builder.intern("[]="), 2);
        let function =
            builder.add_function(native_method(Native::ArrayIndexSet, 2));
        builder.add_method(array_class, index_set, function);
    }

    // ── Ports ──────────────────────────────────────────────────────
    {
        let send = Selector::method(builder.intern("send"), 1);
        let function = {
            let mut w = BytecodeWriter::new();
            w.op_u8_u8(Op::InvokeNativeYield, 2, Native::PortSend as u8);
            w.op(Op::Throw);
            builder.add_function(FunctionDesc {
                arity: 2,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        builder.add_method(port_class, send, function);

        let send_exit = Selector::method(builder.intern("sendExit"), 1);
        let function = {
            let mut w = BytecodeWriter::new();
            w.op_u8_u8(Op::InvokeNativeYield, 2, Native::PortSendExit as u8);
            w.op(Op::Throw);
            builder.add_function(FunctionDesc {
                arity: 2,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        builder.add_method(port_class, send_exit, function);

        let increment = Selector::method(builder.intern("incrementRef"), 0);
        let function =
            builder.add_function(native_method(Native::PortIncrementRef, 0));
        builder.add_method(port_class, increment, function);

        let decrement = Selector::method(builder.intern("decrementRef"), 0);
        let function =
            builder.add_function(native_method(Native::PortDecrementRef, 0));
        builder.add_method(port_class, decrement, function);
    }

    // ── Coroutines ─────────────────────────────────────────────────
    //
    // `coroutineStart` carries the pinned prologue: two literal zeros
    // and a coroutine-change, so a seeded stack resumes right past it
    // with the first passed value on top.
    {
        let caller = Selector::method(builder.intern("caller"), 0);
        let caller_fn =
            builder.add_function(native_method(Native::CoroutineCaller, 0));
        builder.add_method(coroutine_class, caller, caller_fn);

        let call_selector = Selector::method(crate::interning::CALL_ID, 1);
        let start = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral0);
            w.op(Op::LoadLiteral0);
            w.op(Op::CoroutineChange);
            w.op_u8(Op::LoadLocal, 2); // entry
            w.op_u8(Op::LoadLocal, 1); // first value
            w.op_i32(Op::InvokeMethod, call_selector.raw() as i32);
            w.op_u8(Op::LoadLocal, 4); // the coroutine
            w.op_i32(Op::InvokeMethod, caller.raw() as i32);
            w.op_u8(Op::LoadLocal, 1); // the result
            w.op(Op::CoroutineChange); // hand the result to the caller
            builder.add_function(FunctionDesc {
                arity: 2,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        builder.add_method(
            coroutine_class,
            Selector::method(crate::interning::COROUTINE_START_ID, 1),
            start,
        );
    }

    // ── The spawn entry ────────────────────────────────────────────
    //
    // `call(closure, argument)`: invoke the closure, then terminate the
    // process; it never returns into the seeded null return address.
    {
        let call_selector = Selector::method(crate::interning::CALL_ID, 1);
        let entry_call = {
            let mut w = BytecodeWriter::new();
            w.op_u8(Op::LoadLocal, 2); // closure
            w.op_u8(Op::LoadLocal, 2); // argument
            w.op_i32(Op::InvokeMethod, call_selector.raw() as i32);
            w.op(Op::Pop);
            w.op_u8(Op::LoadLiteral, 2); // terminate
            w.op(Op::ProcessYield);
            builder.add_function(FunctionDesc {
                arity: 3,
                literals: Vec::new(),
                catch_ranges: Vec::new(),
                code: w.finish(),
            })
        };
        builder.add_method(
            spawn_entry_class,
            Selector::method(crate::interning::CALL_ID, 2),
            entry_call,
        );
    }
    let spawn_entry_constant = builder.add_constant(Literal::Instance {
        class: spawn_entry_class,
        immutable: true,
        fields: Vec::new(),
    });

    // ── Static helpers ─────────────────────────────────────────────
    let print_fn = builder.add_function(native_static(Native::PrintToConsole, 2));
    let print_static = builder.add_static_method(print_fn);
    let gc_fn = builder.add_function(native_static(Native::Gc, 1));
    let gc_static = builder.add_static_method(gc_fn);
    let array_new_fn = builder.add_function(native_static(Native::ArrayNew, 2));
    let array_new_static = builder.add_static_method(array_new_fn);
    let spawn_fn = builder.add_function(native_static(Native::ProcessSpawn, 4));
    let process_spawn_static = builder.add_static_method(spawn_fn);
    let queue_fn =
        builder.add_function(native_static(Native::ProcessQueueGetMessage, 1));
    let queue_static = builder.add_static_method(queue_fn);
    let port_create_fn = builder.add_function(native_static(Native::PortCreate, 1));
    let port_create_static = builder.add_static_method(port_create_fn);
    let coroutine_new_fn =
        builder.add_function(native_static(Native::CoroutineNew, 2));
    let coroutine_new_static = builder.add_static_method(coroutine_new_fn);
    let coroutine_current_fn =
        builder.add_function(native_static(Native::CoroutineCurrent, 1));
    let coroutine_current_static = builder.add_static_method(coroutine_current_fn);
    let link_port_fn =
        builder.add_function(native_static(Native::ProcessLinkPort, 2));
    let link_port_static = builder.add_static_method(link_port_fn);
    let is_immutable_fn =
        builder.add_function(native_static(Native::IsImmutable, 1));
    let is_immutable_static = builder.add_static_method(is_immutable_fn);
    let stopwatch_fn = builder.add_function(native_static(Native::StopwatchNow, 1));
    let stopwatch_now_static = builder.add_static_method(stopwatch_fn);

    // `receive`: poll the mailbox, yielding while it is empty.
    let receive_static = {
        let mut w = BytecodeWriter::new();
        let top = w.new_label();
        let done = w.new_label();
        w.bind(top);
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::InvokeStatic, queue_static as i32);
        w.op(Op::LoadLocal0);
        w.op_i32(Op::LoadConstUnfold, 0); // the queue-empty sentinel
        w.op(Op::IdenticalNonNumeric);
        w.branch_forward(Op::BranchIfFalseWide, done);
        w.op(Op::Pop);
        w.op(Op::LoadLiteral0); // sleep
        w.op(Op::ProcessYield);
        w.op(Op::Pop);
        w.branch_back(Op::BranchBack, top);
        w.bind(done);
        w.op_u8_u8(Op::Return, 1, 1);
        let function = builder.add_function(FunctionDesc {
            arity: 1,
            literals: vec![Literal::Sentinel],
            catch_ranges: Vec::new(),
            code: w.finish(),
        });
        builder.add_static_method(function)
    };

    builder.roles = SpecialRoles {
        meta: meta_class,
        null: null_class,
        boolean: bool_class,
        smi: smi_class,
        large_integer: large_integer_class,
        double: double_class,
        string: string_class,
        array: array_class,
        byte_array: byte_array_class,
        boxed: boxed_class,
        stack: stack_class,
        coroutine: coroutine_class,
        function: function_class,
        initializer: initializer_class,
        port: port_class,
        sentinel: sentinel_class,
        error: error_class,
    };

    CoreLibrary {
        object_class,
        meta_class,
        null_class,
        bool_class,
        smi_class,
        large_integer_class,
        double_class,
        string_class,
        array_class,
        byte_array_class,
        boxed_class,
        stack_class,
        coroutine_class,
        function_class,
        initializer_class,
        port_class,
        sentinel_class,
        error_class,
        spawn_entry_class,
        spawn_entry_constant,
        print_static,
        gc_static,
        array_new_static,
        process_spawn_static,
        receive_static,
        port_create_static,
        coroutine_new_static,
        coroutine_current_static,
        link_port_static,
        is_immutable_static,
        stopwatch_now_static,
    }
}

/// Install `main` (a zero-argument function) as the program entry: the
/// stub calls it, discards the result and terminates the process.
pub fn set_main(builder: &mut ProgramBuilder, main_function: usize) {
    let main_static = builder.add_static_method(main_function);
    let mut w = BytecodeWriter::new();
    w.op_i32(Op::InvokeStatic, main_static as i32);
    w.op(Op::Pop);
    w.op_u8(Op::LoadLiteral, 2); // terminate
    w.op(Op::ProcessYield);
    let entry = builder.add_function(FunctionDesc {
        arity: 1,
        literals: Vec::new(),
        catch_ranges: Vec::new(),
        code: w.finish(),
    });
    builder.entry = entry;
    builder.main_arity = 0;
}
