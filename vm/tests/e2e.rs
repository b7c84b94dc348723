//! End-to-end scenarios: snapshots are authored with the program
//! builder, loaded and driven through the public API, and the process
//! exit status carries the verdict (0 = every in-program assertion
//! held, 255 = an assertion threw and nothing caught it).

use bytecode::{BytecodeWriter, Op};
use object::{CatchRange, Selector};
use vm::corelib::{install_core, set_main, CoreLibrary};
use vm::snapshot::{ClassDesc, FunctionDesc, Literal, ProgramBuilder, StaticDesc};

fn run(build: impl FnOnce(&mut ProgramBuilder, &CoreLibrary) -> usize) -> i32 {
    let mut builder = ProgramBuilder::empty();
    let core = install_core(&mut builder);
    let main_function = build(&mut builder, &core);
    set_main(&mut builder, main_function);
    let bytes = builder.write();
    vm::setup()
        .with_worker_count(2)
        .run_snapshot(&bytes)
        .expect("snapshot loads")
}

fn error_literal(core: &CoreLibrary) -> Literal {
    Literal::Instance {
        class: core.error_class,
        immutable: true,
        fields: Vec::new(),
    }
}

fn plain_function(arity: usize, literals: Vec<Literal>, code: Vec<u8>) -> FunctionDesc {
    FunctionDesc { arity, literals, catch_ranges: Vec::new(), code }
}

/// Emit: compare the two topmost values with `identical`, return 0 on
/// success, throw literal 0 on mismatch. `locals` is the frame height
/// at the Return (one slot, the zero result, unless noted).
fn finish_assert(w: &mut BytecodeWriter, locals: u8) {
    w.op(Op::Identical);
    let ok = w.new_label();
    w.branch_forward(Op::BranchIfTrueWide, ok);
    w.op_i32(Op::LoadConstUnfold, 0);
    w.op(Op::Throw);
    w.bind(ok);
    w.op(Op::LoadLiteral0);
    w.op_u8_u8(Op::Return, locals, 0);
}

// ── Scenario 1: arithmetic ─────────────────────────────────────────

#[test]
fn arithmetic_runs_to_completion() {
    let status = run(|builder, core| {
        let plus = Selector::method(builder.intern("+"), 1);
        let mut w = BytecodeWriter::new();
        w.op_u8(Op::LoadLiteral, 40);
        w.op_u8(Op::LoadLiteral, 2);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.op_u8(Op::LoadLiteral, 42);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![error_literal(core)],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Scenario 2: smi overflow falls back to LargeInteger ────────────

#[test]
fn smi_overflow_produces_large_integer() {
    let status = run(|builder, core| {
        let plus = Selector::method(builder.intern("+"), 1);
        let mut w = BytecodeWriter::new();
        // (2^62 - 1) + 1 overflows the smi range; the general dispatch
        // path lands in the smi method whose fallback boxes the sum.
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op(Op::LoadLiteral1);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.op_i32(Op::LoadConstUnfold, 2);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Smi((1 << 62) - 1),
                Literal::LargeInteger(1 << 62),
            ],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Scenario 3: identical on doubles ───────────────────────────────

#[test]
fn identical_compares_doubles_bitwise() {
    let status = run(|builder, core| {
        let mut w = BytecodeWriter::new();
        // identical(nan, nan) is true: equal bit patterns.
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op(Op::Identical);
        w.op(Op::LoadLiteralTrue);
        w.op(Op::Identical);
        let first_ok = w.new_label();
        w.branch_forward(Op::BranchIfTrueWide, first_ok);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        w.bind(first_ok);
        // identical(-0.0, 0.0) is false: the sign bit differs.
        w.op_i32(Op::LoadConstUnfold, 2);
        w.op_i32(Op::LoadConstUnfold, 3);
        w.op(Op::Identical);
        w.op(Op::LoadLiteralFalse);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Double(f64::NAN),
                Literal::Double(-0.0),
                Literal::Double(0.0),
            ],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Scenario 4: coroutine ping-pong ────────────────────────────────

#[test]
fn coroutines_ping_pong_a_thousand_values() {
    const ROUNDS: i32 = 1000;
    let status = run(|builder, core| {
        let call = Selector::method(builder.intern("call"), 1);
        let caller = Selector::method(builder.intern("caller"), 0);
        let minus = Selector::method(builder.intern("-"), 1);
        let plus = Selector::method(builder.intern("+"), 1);

        // The echo side: receive a value, hand it straight back, for
        // ROUNDS iterations, through the current coroutine's caller.
        let echo_class = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let echo_call = {
            let mut w = BytecodeWriter::new();
            // Frame: [recv, x, ret]; locals: counter, value.
            w.op_i32(Op::LoadLiteralWide, ROUNDS); // counter
            w.op_u8(Op::LoadLocal, 2); // value = x
            let top = w.new_label();
            let done = w.new_label();
            w.bind(top);
            // counter == 0 ?
            w.op_u8(Op::LoadLocal, 1);
            w.op(Op::LoadLiteral0);
            w.op(Op::Identical);
            w.branch_forward(Op::BranchIfTrueWide, done);
            // caller coroutine of the current coroutine
            w.op(Op::LoadLiteralNull);
            w.op_i32(Op::InvokeStatic, core.coroutine_current_static as i32);
            w.op_i32(Op::InvokeMethod, caller.raw() as i32);
            // hand the value over; resumes here with the next one
            w.op_u8(Op::LoadLocal, 1);
            w.op(Op::CoroutineChange);
            w.op_u8(Op::StoreLocal, 1);
            w.op(Op::Pop);
            // counter -= 1
            w.op_u8(Op::LoadLocal, 1);
            w.op(Op::LoadLiteral1);
            w.op_i32(Op::InvokeSub, minus.raw() as i32);
            w.op_u8(Op::StoreLocal, 2);
            w.op(Op::Pop);
            w.branch_back(Op::BranchBackWide, top);
            w.bind(done);
            w.op_u8_u8(Op::Return, 2, 2);
            builder.add_function(plain_function(2, Vec::new(), w.finish()))
        };
        builder.add_method(echo_class, call, echo_call);
        let echo_constant = builder.add_constant(Literal::Instance {
            class: echo_class,
            immutable: true,
            fields: Vec::new(),
        });

        // The driving side: send 0..ROUNDS and require each value back.
        let mut w = BytecodeWriter::new();
        // co = coroutineNew(echo)
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::InvokeStatic, core.coroutine_new_static as i32);
        w.op(Op::LoadLiteral0); // i
        let top = w.new_label();
        let done = w.new_label();
        let fail = w.new_label();
        w.bind(top);
        // i == ROUNDS ?
        w.op(Op::LoadLocal0);
        w.op_i32(Op::LoadLiteralWide, ROUNDS);
        w.op(Op::Identical);
        w.branch_forward(Op::BranchIfTrueWide, done);
        // echo = coroutineChange(co, i)
        w.op_u8(Op::LoadLocal, 1); // co
        w.op_u8(Op::LoadLocal, 1); // i
        w.op(Op::CoroutineChange);
        // echoed value must equal i
        w.op_u8(Op::LoadLocal, 1);
        w.op(Op::Identical);
        w.branch_forward(Op::BranchIfFalseWide, fail);
        // i += 1
        w.op(Op::LoadLiteral1);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.branch_back(Op::BranchBackWide, top);
        w.bind(done);
        w.op(Op::LoadLiteral0);
        w.op_u8_u8(Op::Return, 3, 0);
        w.bind(fail);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Instance {
                    class: echo_class,
                    immutable: true,
                    fields: Vec::new(),
                },
            ],
            w.finish(),
        ));
        let _ = echo_constant;
        builder.functions.len() - 1
    });
    assert_eq!(status, 0);
}

// ── Scenario 5: spawn rejects mutable arguments ────────────────────

#[test]
fn spawn_with_mutable_argument_fails() {
    let status = run(|builder, core| {
        // A trivially callable (and immutable) closure.
        let closure_class = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let call = Selector::method(builder.intern("call"), 1);
        let closure_call = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteralNull);
            w.op_u8_u8(Op::Return, 1, 2);
            builder.add_function(plain_function(2, Vec::new(), w.finish()))
        };
        builder.add_method(closure_class, call, closure_call);

        let mut w = BytecodeWriter::new();
        // spawn(entry, closure, mutableList) must fail with
        // wrong-argument-type, which the helper turns into a throw.
        w.op(Op::LoadLiteralNull); // helper receiver slot
        w.op_i32(Op::LoadConstUnfold, 1); // the spawn entry
        w.op_i32(Op::LoadConstUnfold, 2); // the closure
        w.op(Op::LoadLiteralNull); // arrayNew receiver slot
        w.op_u8(Op::LoadLiteral, 3);
        w.op_i32(Op::InvokeStatic, core.array_new_static as i32); // mutable
        let call_site = w.here();
        w.op_i32(Op::InvokeStatic, core.process_spawn_static as i32);
        let after_call = w.here();
        w.op(Op::Pop);
        // The spawn unexpectedly succeeded: fail the test.
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        let handler = w.here();
        w.op(Op::Pop); // the caught error
        w.op(Op::LoadLiteral0);
        w.op_u8_u8(Op::Return, 1, 0);
        let code = w.finish();
        builder.add_function(FunctionDesc {
            arity: 0,
            literals: vec![
                error_literal(core),
                Literal::Function(0), // patched below
                Literal::Instance {
                    class: closure_class,
                    immutable: true,
                    fields: Vec::new(),
                },
            ],
            catch_ranges: vec![CatchRange {
                start: call_site as u32,
                end: (after_call + 1) as u32,
                handler: handler as u32,
                frame_offset: 0,
            }],
            code,
        });
        let main = builder.functions.len() - 1;
        // The spawn entry constant lives in the constant table; reuse
        // it as a literal through an instance description.
        builder.functions[main].literals[1] = Literal::Instance {
            class: core.spawn_entry_class,
            immutable: true,
            fields: Vec::new(),
        };
        main
    });
    assert_eq!(status, 0);
}

// ── Scenario 5b: spawn with immutable argument works ───────────────

#[test]
fn spawn_delivers_port_message() {
    let status = run(|builder, core| {
        let call = Selector::method(builder.intern("call"), 1);
        let send = Selector::method(builder.intern("send"), 1);

        // The child: send 42 to the port it was spawned with.
        let replier_class = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let replier_call = {
            let mut w = BytecodeWriter::new();
            // Frame: [recv, port, ret]
            w.op_u8(Op::LoadLocal, 1); // the port
            w.op_u8(Op::LoadLiteral, 42);
            w.op_i32(Op::InvokeMethod, send.raw() as i32);
            w.op_u8_u8(Op::Return, 1, 2);
            builder.add_function(plain_function(2, Vec::new(), w.finish()))
        };
        builder.add_method(replier_class, call, replier_call);

        let mut w = BytecodeWriter::new();
        // port = portCreate()
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::InvokeStatic, core.port_create_static as i32);
        // spawn(entry, replier, port)
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::LoadConstUnfold, 1); // spawn entry instance
        w.op_i32(Op::LoadConstUnfold, 2); // replier closure
        w.op_u8(Op::LoadLocal, 3); // the port
        w.op_i32(Op::InvokeStatic, core.process_spawn_static as i32);
        w.op(Op::Pop);
        // receive() must deliver 42
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::InvokeStatic, core.receive_static as i32);
        w.op_u8(Op::LoadLiteral, 42);
        w.op(Op::Identical);
        let ok = w.new_label();
        w.branch_forward(Op::BranchIfTrueWide, ok);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        w.bind(ok);
        w.op(Op::LoadLiteral0);
        w.op_u8_u8(Op::Return, 2, 0);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Instance {
                    class: core.spawn_entry_class,
                    immutable: true,
                    fields: Vec::new(),
                },
                Literal::Instance {
                    class: replier_class,
                    immutable: true,
                    fields: Vec::new(),
                },
            ],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Scenario 6: deep recursion hits the stack cap ──────────────────

#[test]
fn stack_overflow_exception_is_catchable() {
    let status = run(|builder, core| {
        // f() { return f(); }
        let recurse = {
            let mut w = BytecodeWriter::new();
            w.op_i32(Op::InvokeStatic, 0); // patched below
            w.op_u8_u8(Op::Return, 1, 0);
            builder.add_function(plain_function(0, Vec::new(), w.finish()))
        };
        let recurse_static = builder.add_static_method(recurse);
        // Patch the self call now that the static index exists.
        let code = &mut builder.functions[recurse].code;
        code[1..5].copy_from_slice(&(recurse_static as i32).to_le_bytes());

        let mut w = BytecodeWriter::new();
        let call_site = w.here();
        w.op_i32(Op::InvokeStatic, recurse_static as i32);
        let after_call = w.here();
        w.op(Op::Pop);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        let handler = w.here();
        w.op(Op::Pop);
        w.op(Op::LoadLiteral0);
        w.op_u8_u8(Op::Return, 1, 0);
        let code = w.finish();
        builder.add_function(FunctionDesc {
            arity: 0,
            literals: vec![error_literal(core)],
            catch_ranges: vec![CatchRange {
                start: call_site as u32,
                end: (after_call + 1) as u32,
                handler: handler as u32,
                frame_offset: 0,
            }],
            code,
        })
    });
    assert_eq!(status, 0);
}

// ── Dispatch forms ─────────────────────────────────────────────────

#[test]
fn fast_and_vtable_dispatch_agree_with_method_dispatch() {
    let status = run(|builder, core| {
        let f = Selector::method(builder.intern("f"), 0);

        let class_a = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let class_b = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let return_1 = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral1);
            w.op_u8_u8(Op::Return, 1, 1);
            builder.add_function(plain_function(1, Vec::new(), w.finish()))
        };
        let return_2 = {
            let mut w = BytecodeWriter::new();
            w.op_u8(Op::LoadLiteral, 2);
            w.op_u8_u8(Op::Return, 1, 1);
            builder.add_function(plain_function(1, Vec::new(), w.finish()))
        };
        builder.add_method(class_a, f, return_1);
        builder.add_method(class_b, f, return_2);

        let mut w = BytecodeWriter::new();
        // a.f() via the primary cache, b.f() via the dispatch table,
        // a.f() via the vtable; 1 + 2 + 1 == 4.
        let plus = Selector::method(builder.intern("+"), 1);
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::InvokeMethod, f.raw() as i32);
        w.op_i32(Op::LoadConstUnfold, 2);
        w.op_i32(Op::InvokeMethodFast, f.raw() as i32);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::InvokeMethodVtable, f.raw() as i32);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.op_u8(Op::LoadLiteral, 4);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Instance {
                    class: class_a,
                    immutable: false,
                    fields: Vec::new(),
                },
                Literal::Instance {
                    class: class_b,
                    immutable: false,
                    fields: Vec::new(),
                },
            ],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

#[test]
fn invoke_test_variants_probe_without_calling() {
    let status = run(|builder, core| {
        let f = Selector::method(builder.intern("f"), 0);
        let class_a = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let return_1 = {
            let mut w = BytecodeWriter::new();
            w.op(Op::LoadLiteral1);
            w.op_u8_u8(Op::Return, 1, 1);
            builder.add_function(plain_function(1, Vec::new(), w.finish()))
        };
        builder.add_method(class_a, f, return_1);

        let mut w = BytecodeWriter::new();
        // `is`-style probes: true on an implementer, false on a smi.
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::InvokeTest, f.raw() as i32);
        w.op(Op::LoadLiteralTrue);
        w.op(Op::Identical);
        let ok1 = w.new_label();
        w.branch_forward(Op::BranchIfTrueWide, ok1);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        w.bind(ok1);
        w.op(Op::LoadLiteral0);
        w.op_i32(Op::InvokeTestFast, f.raw() as i32);
        w.op(Op::LoadLiteralFalse);
        w.op(Op::Identical);
        let ok2 = w.new_label();
        w.branch_forward(Op::BranchIfTrueWide, ok2);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        w.bind(ok2);
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::InvokeTestVtable, f.raw() as i32);
        w.op(Op::LoadLiteralTrue);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Instance {
                    class: class_a,
                    immutable: false,
                    fields: Vec::new(),
                },
            ],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── noSuchMethod ───────────────────────────────────────────────────

#[test]
fn missing_method_routes_to_no_such_method() {
    let status = run(|builder, core| {
        // A class overriding noSuchMethod to return 99.
        let class_n = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 0,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let nsm = Selector::method(builder.intern("noSuchMethod"), 1);
        let return_99 = {
            let mut w = BytecodeWriter::new();
            w.op_u8(Op::LoadLiteral, 99);
            w.op_u8_u8(Op::Return, 1, 2);
            builder.add_function(plain_function(2, Vec::new(), w.finish()))
        };
        builder.add_method(class_n, nsm, return_99);

        let missing = Selector::method(builder.intern("missing"), 0);
        let missing_setter = Selector::setter(builder.intern("missing"));

        let mut w = BytecodeWriter::new();
        // n.missing() answers through noSuchMethod.
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_i32(Op::InvokeMethod, missing.raw() as i32);
        w.op_u8(Op::LoadLiteral, 99);
        w.op(Op::Identical);
        let ok = w.new_label();
        w.branch_forward(Op::BranchIfTrueWide, ok);
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        w.bind(ok);
        // A setter must answer the assigned value, not the trampoline
        // result.
        w.op_i32(Op::LoadConstUnfold, 1);
        w.op_u8(Op::LoadLiteral, 7);
        w.op_i32(Op::InvokeMethod, missing_setter.raw() as i32);
        w.op_u8(Op::LoadLiteral, 7);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![
                error_literal(core),
                Literal::Instance {
                    class: class_n,
                    immutable: false,
                    fields: Vec::new(),
                },
            ],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Allocation, GC and the write barrier ───────────────────────────

#[test]
fn allocation_survives_forced_gc_with_cross_heap_references() {
    let status = run(|builder, core| {
        // Imm: one immutable field; Pair: two mutable fields.
        let imm_class = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 1,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });
        let pair_class = builder.add_class(ClassDesc {
            type_tag: object::TypeTag::Instance,
            fields: 2,
            superclass: Some(core.object_class),
            methods: Vec::new(),
        });

        let mut w = BytecodeWriter::new();
        // imm = AllocateImmutable(Imm, field0 = 7): all fields are
        // immutable, so the object lands in the immutable heap.
        w.op_u8(Op::LoadLiteral, 7);
        w.op_i32(Op::AllocateImmutable, imm_class as i32);
        // pair = Allocate(Pair, field0 = imm, field1 = null): mutable,
        // holding an immutable pointer; the store buffer records it.
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::Allocate, pair_class as i32);
        // Force a mutable collection; the pair moves.
        w.op(Op::LoadLiteralNull);
        w.op_i32(Op::InvokeStatic, core.gc_static as i32);
        w.op(Op::Pop);
        // pair.field0.field0 must still be 7.
        w.op(Op::LoadLocal0);
        w.op_u8(Op::LoadField, 0);
        w.op_u8(Op::LoadField, 0);
        w.op_u8(Op::LoadLiteral, 7);
        finish_assert(&mut w, 2);
        builder.add_function(plain_function(
            0,
            vec![error_literal(core)],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

#[test]
fn boxed_locals_round_trip_through_the_box() {
    let status = run(|builder, core| {
        let mut w = BytecodeWriter::new();
        // box = AllocateBoxed(5); write 9 through it; read it back.
        w.op_u8(Op::LoadLiteral, 5);
        w.op(Op::AllocateBoxed);
        w.op_u8(Op::LoadLiteral, 9);
        w.op_u8(Op::StoreBoxed, 1);
        w.op(Op::Pop);
        w.op_u8(Op::LoadBoxed, 0);
        w.op_u8(Op::LoadLiteral, 9);
        finish_assert(&mut w, 2);
        builder.add_function(plain_function(
            0,
            vec![error_literal(core)],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Lazy statics ───────────────────────────────────────────────────

#[test]
fn static_initializer_runs_once() {
    let status = run(|builder, core| {
        let plus = Selector::method(builder.intern("+"), 1);
        // The initializer stores 5 into the slot and returns it.
        let init = {
            let mut w = BytecodeWriter::new();
            w.op_u8(Op::LoadLiteral, 5);
            w.op_i32(Op::StoreStatic, 0);
            w.op_u8_u8(Op::Return, 1, 0);
            builder.add_function(plain_function(0, Vec::new(), w.finish()))
        };
        builder.add_static(StaticDesc::Initializer(init));

        let mut w = BytecodeWriter::new();
        // First load runs the initializer, the second reads the stored
        // value: 5 + 5 == 10.
        w.op_i32(Op::LoadStaticInit, 0);
        w.op_i32(Op::LoadStaticInit, 0);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.op_u8(Op::LoadLiteral, 10);
        finish_assert(&mut w, 1);
        builder.add_function(plain_function(
            0,
            vec![error_literal(core)],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Finally via subroutines ────────────────────────────────────────

#[test]
fn subroutine_call_runs_finally_block() {
    let status = run(|builder, core| {
        builder.add_static(StaticDesc::Value(Literal::Smi(0)));
        let mut w = BytecodeWriter::new();
        let finally = w.new_label();
        let sub_ret = w.new_label();
        w.subroutine_call(finally, sub_ret);
        // Resumes here after the finally block ran.
        w.op_i32(Op::LoadStatic, 0);
        w.op_u8(Op::LoadLiteral, 7);
        finish_assert(&mut w, 1);
        w.bind(finally);
        w.op_u8(Op::LoadLiteral, 7);
        w.op_i32(Op::StoreStatic, 0);
        w.op(Op::Pop);
        w.bind(sub_ret);
        w.op(Op::SubroutineReturn);
        builder.add_function(plain_function(
            0,
            vec![error_literal(core)],
            w.finish(),
        ))
    });
    assert_eq!(status, 0);
}

// ── Uncaught exceptions terminate with a nonzero status ────────────

#[test]
fn uncaught_exception_reports_nonzero_status() {
    let status = run(|builder, core| {
        let mut w = BytecodeWriter::new();
        w.op_i32(Op::LoadConstUnfold, 0);
        w.op(Op::Throw);
        builder.add_function(plain_function(
            0,
            vec![error_literal(core)],
            w.finish(),
        ))
    });
    assert_eq!(status, 255);
}

// ── Snapshot round trip ────────────────────────────────────────────

#[test]
fn snapshot_round_trip_is_stable() {
    let mut builder = ProgramBuilder::empty();
    let core = install_core(&mut builder);
    let main = {
        let mut w = BytecodeWriter::new();
        let plus = Selector::method(builder.intern("+"), 1);
        w.op_u8(Op::LoadLiteral, 40);
        w.op_u8(Op::LoadLiteral, 2);
        w.op_i32(Op::InvokeAdd, plus.raw() as i32);
        w.op_u8_u8(Op::Return, 1, 0);
        builder.add_function(plain_function(
            0,
            vec![error_literal(&core)],
            w.finish(),
        ))
    };
    set_main(&mut builder, main);
    let original = builder.write();

    let program = vm::snapshot::load(&original, heap::HeapSettings::default())
        .expect("load");
    let rewritten = vm::snapshot::write_program(&program);
    assert_eq!(
        original, rewritten,
        "serializing a loaded program reproduces the snapshot"
    );

    // And the rewritten snapshot still runs.
    let status = vm::setup().run_snapshot(&rewritten).expect("reload");
    assert_eq!(status, 0);
}

#[test]
fn snapshot_round_trip_through_a_file() {
    let mut builder = ProgramBuilder::empty();
    let core = install_core(&mut builder);
    let main = {
        let mut w = BytecodeWriter::new();
        w.op(Op::LoadLiteral0);
        w.op_u8_u8(Op::Return, 1, 0);
        builder.add_function(plain_function(
            0,
            vec![error_literal(&core)],
            w.finish(),
        ))
    };
    set_main(&mut builder, main);
    let bytes = builder.write();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("program.snapshot");
    std::fs::write(&path, &bytes).expect("write");
    let status = vm::setup()
        .run_snapshot_from_file(&path)
        .expect("run from file");
    assert_eq!(status, 0);
}

// ── Rejected snapshots ─────────────────────────────────────────────

#[test]
fn bad_magic_is_rejected() {
    let result = vm::setup().run_snapshot(&[0xCA, 0xFE, 0, 0, 0, 0]);
    assert!(matches!(
        result,
        Err(vm::VmError::Snapshot(vm::SnapshotError::Invalid(_)))
    ));
}
