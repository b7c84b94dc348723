use std::ptr::NonNull;

use object::{
    value_is_immutable, Array, Coroutine, Double, Function, LargeInteger,
    Selector, Stack, Value, VmString,
};

use crate::interning::{CALL_ID, COROUTINE_START_ID};
use crate::interpreter::short_print;
use crate::port::PortHandle;
use crate::process::Process;

/// What a native hands back to the interpreter: a proper value, or a
/// failure consumed at the bytecode boundary (*retry-after-gc* restarts
/// the bytecode, the other kinds are reified and fall through to the
/// bytecode after the invoke).
pub enum NativeResult {
    Value(Value),
    Failure(Value),
}

use NativeResult::{Failure, Value as Done};

pub type NativeFn = fn(&mut Process, &[Value]) -> NativeResult;

/// Built-in operations reachable through `invoke-native`. The numbering
/// is part of the snapshot contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Native {
    PrintToConsole = 0,
    Gc,

    SmiToDouble,
    SmiNegate,
    SmiAdd,
    SmiSub,
    SmiMul,
    SmiMod,
    SmiTruncDiv,
    SmiBitNot,
    SmiBitAnd,
    SmiBitOr,
    SmiBitXor,
    SmiBitShr,
    SmiBitShl,
    SmiEqual,
    SmiLess,
    SmiLessEqual,
    SmiGreater,
    SmiGreaterEqual,

    IntAdd,
    IntSub,
    IntMul,
    IntMod,
    IntTruncDiv,
    IntNegate,
    IntBitNot,
    IntBitAnd,
    IntBitOr,
    IntBitXor,
    IntBitShr,
    IntBitShl,
    IntEqual,
    IntLess,
    IntLessEqual,
    IntGreater,
    IntGreaterEqual,

    DoubleAdd,
    DoubleSub,
    DoubleMul,
    DoubleDiv,
    DoubleMod,
    DoubleNegate,
    DoubleEqual,
    DoubleLess,
    DoubleLessEqual,
    DoubleGreater,
    DoubleGreaterEqual,
    DoubleIsNaN,

    StringLength,
    StringCodeUnitAt,
    StringEqual,
    StringAdd,

    ArrayNew,
    ArrayLength,
    ArrayIndexGet,
    ArrayIndexSet,

    ProcessSpawn,
    ProcessQueueGetMessage,
    ProcessLinkPort,

    PortCreate,
    PortSend,
    PortSendExit,
    PortIncrementRef,
    PortDecrementRef,

    CoroutineNew,
    CoroutineCurrent,
    CoroutineCaller,

    StopwatchFrequency,
    StopwatchNow,

    IsImmutable,
}

impl Native {
    pub const COUNT: usize = Self::IsImmutable as usize + 1;
}

/// The natives table, indexed by the byte operand of `invoke-native`.
pub fn native_function(index: u8) -> NativeFn {
    NATIVE_TABLE[index as usize]
}

#[rustfmt::skip]
static NATIVE_TABLE: [NativeFn; Native::COUNT] = [
    native_print_to_console,
    native_gc,
    native_smi_to_double,
    native_smi_negate,
    native_smi_add, native_smi_sub, native_smi_mul, native_smi_mod,
    native_smi_trunc_div,
    native_smi_bit_not, native_smi_bit_and, native_smi_bit_or,
    native_smi_bit_xor, native_smi_bit_shr, native_smi_bit_shl,
    native_smi_equal, native_smi_less, native_smi_less_equal,
    native_smi_greater, native_smi_greater_equal,
    native_int_add, native_int_sub, native_int_mul, native_int_mod,
    native_int_trunc_div, native_int_negate,
    native_int_bit_not, native_int_bit_and, native_int_bit_or,
    native_int_bit_xor, native_int_bit_shr, native_int_bit_shl,
    native_int_equal, native_int_less, native_int_less_equal,
    native_int_greater, native_int_greater_equal,
    native_double_add, native_double_sub, native_double_mul,
    native_double_div, native_double_mod, native_double_negate,
    native_double_equal, native_double_less, native_double_less_equal,
    native_double_greater, native_double_greater_equal,
    native_double_is_nan,
    native_string_length, native_string_code_unit_at, native_string_equal,
    native_string_add,
    native_array_new, native_array_length, native_array_index_get,
    native_array_index_set,
    native_process_spawn, native_process_queue_get_message,
    native_process_link_port,
    native_port_create, native_port_send, native_port_send_exit,
    native_port_increment_ref, native_port_decrement_ref,
    native_coroutine_new, native_coroutine_current, native_coroutine_caller,
    native_stopwatch_frequency, native_stopwatch_now,
    native_is_immutable,
];

// ── Argument helpers ───────────────────────────────────────────────

fn as_smi(value: Value) -> Result<i64, NativeResult> {
    if value.is_smi() {
        // SAFETY: checked.
        Ok(unsafe { value.to_smi() })
    } else {
        Err(Failure(Value::WRONG_ARGUMENT_TYPE))
    }
}

/// Smi or LargeInteger; everything else is a type failure.
fn as_integer(process: &Process, value: Value) -> Result<i64, NativeResult> {
    if value.is_smi() {
        // SAFETY: checked.
        return Ok(unsafe { value.to_smi() });
    }
    if value.is_ref() {
        // SAFETY: live object.
        let class = unsafe { value.as_ref::<object::HeapHeader>().class_value() };
        if class == process.program.specials().large_integer_class {
            // SAFETY: checked.
            return Ok(unsafe { value.as_ref::<LargeInteger>() }.value());
        }
    }
    Err(Failure(Value::WRONG_ARGUMENT_TYPE))
}

/// Double, smi or LargeInteger, widened to f64.
fn as_number(process: &Process, value: Value) -> Result<f64, NativeResult> {
    if value.is_smi() {
        // SAFETY: checked.
        return Ok(unsafe { value.to_smi() } as f64);
    }
    if value.is_ref() {
        // SAFETY: live object.
        let class = unsafe { value.as_ref::<object::HeapHeader>().class_value() };
        let specials = process.program.specials();
        if class == specials.double_class {
            // SAFETY: checked.
            return Ok(unsafe { value.as_ref::<Double>() }.value());
        }
        if class == specials.large_integer_class {
            // SAFETY: checked.
            return Ok(unsafe { value.as_ref::<LargeInteger>() }.value() as f64);
        }
    }
    Err(Failure(Value::WRONG_ARGUMENT_TYPE))
}

fn as_string<'a>(
    process: &Process,
    value: Value,
) -> Result<&'a VmString, NativeResult> {
    if value.is_ref() {
        // SAFETY: live object.
        let class = unsafe { value.as_ref::<object::HeapHeader>().class_value() };
        if class == process.program.specials().string_class {
            // SAFETY: checked; strings are immutable and outlive the call.
            return Ok(unsafe { &*(value.ref_bits() as *const VmString) });
        }
    }
    Err(Failure(Value::WRONG_ARGUMENT_TYPE))
}

fn as_array_mut<'a>(
    process: &Process,
    value: Value,
) -> Result<&'a mut Array, NativeResult> {
    if value.is_ref() {
        // SAFETY: live object.
        let class = unsafe { value.as_ref::<object::HeapHeader>().class_value() };
        if class == process.program.specials().array_class {
            // SAFETY: checked; the process owns its heap.
            return Ok(unsafe { &mut *(value.ref_bits() as *mut Array) });
        }
    }
    Err(Failure(Value::WRONG_ARGUMENT_TYPE))
}

fn boxed_integer(process: &mut Process, value: i64) -> NativeResult {
    let result = process.new_integer(value);
    if result.is_failure() {
        Failure(result)
    } else {
        Done(result)
    }
}

fn boxed_double(process: &mut Process, value: f64) -> NativeResult {
    let result = process.new_double(value);
    if result.is_failure() {
        Failure(result)
    } else {
        Done(result)
    }
}

fn bool_object(process: &Process, value: bool) -> NativeResult {
    Done(process.program.to_boolean(value))
}

macro_rules! try_native {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(failure) => return failure,
        }
    };
}

// ── Console / GC ───────────────────────────────────────────────────

fn native_print_to_console(process: &mut Process, args: &[Value]) -> NativeResult {
    let text = short_print(&process.program, args[1]);
    process.program.print(&text);
    Done(process.program.specials().null_object)
}

/// Force a collection: request one and fail with *retry-after-gc* so the
/// interpreter runs its ordinary GC path; the retried call finds the
/// request satisfied and returns.
fn native_gc(process: &mut Process, _args: &[Value]) -> NativeResult {
    if !process.pending_gc_native {
        process.pending_gc_native = true;
        process.heap.request_gc();
        return Failure(Value::RETRY_AFTER_GC);
    }
    process.pending_gc_native = false;
    Done(process.program.specials().null_object)
}

// ── Smi arithmetic (receiver checked by dispatch, argument here) ───

fn native_smi_to_double(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    boxed_double(process, x as f64)
}

fn native_smi_negate(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    match x.checked_neg().filter(|&n| Value::fits_smi(n)) {
        Some(n) => Done(Value::from_smi(n)),
        None => boxed_integer(process, -x),
    }
}

macro_rules! smi_binary {
    ($name:ident, $op:ident) => {
        fn $name(_process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_smi(args[0]));
            let y = try_native!(as_smi(args[1]));
            match x.$op(y).filter(|&n| Value::fits_smi(n)) {
                Some(n) => Done(Value::from_smi(n)),
                None => Failure(Value::WRONG_ARGUMENT_TYPE),
            }
        }
    };
}

smi_binary!(native_smi_add, checked_add);
smi_binary!(native_smi_sub, checked_sub);
smi_binary!(native_smi_mul, checked_mul);

fn native_smi_mod(_process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    let y = try_native!(as_smi(args[1]));
    if y == 0 {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    Done(Value::from_smi(x.rem_euclid(y)))
}

fn native_smi_trunc_div(_process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    let y = try_native!(as_smi(args[1]));
    if y == 0 {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    match x.checked_div(y).filter(|&n| Value::fits_smi(n)) {
        Some(n) => Done(Value::from_smi(n)),
        None => Failure(Value::WRONG_ARGUMENT_TYPE),
    }
}

fn native_smi_bit_not(_process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    Done(Value::from_smi(!x))
}

macro_rules! smi_bitwise {
    ($name:ident, $op:tt) => {
        fn $name(_process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_smi(args[0]));
            let y = try_native!(as_smi(args[1]));
            Done(Value::from_smi(x $op y))
        }
    };
}

smi_bitwise!(native_smi_bit_and, &);
smi_bitwise!(native_smi_bit_or, |);
smi_bitwise!(native_smi_bit_xor, ^);

fn native_smi_bit_shr(_process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    let y = try_native!(as_smi(args[1]));
    if !(0..64).contains(&y) {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    Done(Value::from_smi(x >> y))
}

fn native_smi_bit_shl(_process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_smi(args[0]));
    let y = try_native!(as_smi(args[1]));
    if !(0..64).contains(&y) {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    match x.checked_shl(y as u32).filter(|&n| n >> y == x && Value::fits_smi(n)) {
        Some(n) => Done(Value::from_smi(n)),
        None => Failure(Value::WRONG_ARGUMENT_TYPE),
    }
}

macro_rules! smi_compare {
    ($name:ident, $op:tt) => {
        fn $name(process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_smi(args[0]));
            let y = try_native!(as_smi(args[1]));
            bool_object(process, x $op y)
        }
    };
}

smi_compare!(native_smi_equal, ==);
smi_compare!(native_smi_less, <);
smi_compare!(native_smi_less_equal, <=);
smi_compare!(native_smi_greater, >);
smi_compare!(native_smi_greater_equal, >=);

// ── Integer fallbacks (smi or LargeInteger operands) ───────────────

macro_rules! int_binary {
    ($name:ident, $body:expr) => {
        fn $name(process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_integer(process, args[0]));
            let y = try_native!(as_integer(process, args[1]));
            let f: fn(i64, i64) -> Option<i64> = $body;
            match f(x, y) {
                Some(result) => boxed_integer(process, result),
                None => Failure(Value::WRONG_ARGUMENT_TYPE),
            }
        }
    };
}

int_binary!(native_int_add, |x, y| x.checked_add(y));
int_binary!(native_int_sub, |x, y| x.checked_sub(y));
int_binary!(native_int_mul, |x, y| x.checked_mul(y));
int_binary!(native_int_mod, |x, y| {
    if y == 0 {
        None
    } else {
        Some(x.rem_euclid(y))
    }
});
int_binary!(native_int_trunc_div, |x, y| {
    if y == 0 {
        None
    } else {
        x.checked_div(y)
    }
});
int_binary!(native_int_bit_and, |x, y| Some(x & y));
int_binary!(native_int_bit_or, |x, y| Some(x | y));
int_binary!(native_int_bit_xor, |x, y| Some(x ^ y));
int_binary!(native_int_bit_shr, |x, y| {
    (0..64).contains(&y).then(|| x >> y)
});
int_binary!(native_int_bit_shl, |x, y| {
    if !(0..64).contains(&y) {
        return None;
    }
    x.checked_shl(y as u32).filter(|&n| n >> y == x)
});

fn native_int_negate(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_integer(process, args[0]));
    match x.checked_neg() {
        Some(n) => boxed_integer(process, n),
        None => Failure(Value::WRONG_ARGUMENT_TYPE),
    }
}

fn native_int_bit_not(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_integer(process, args[0]));
    boxed_integer(process, !x)
}

macro_rules! int_compare {
    ($name:ident, $op:tt) => {
        fn $name(process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_integer(process, args[0]));
            let y = try_native!(as_integer(process, args[1]));
            bool_object(process, x $op y)
        }
    };
}

int_compare!(native_int_equal, ==);
int_compare!(native_int_less, <);
int_compare!(native_int_less_equal, <=);
int_compare!(native_int_greater, >);
int_compare!(native_int_greater_equal, >=);

// ── Double arithmetic ──────────────────────────────────────────────

macro_rules! double_binary {
    ($name:ident, $op:tt) => {
        fn $name(process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_number(process, args[0]));
            let y = try_native!(as_number(process, args[1]));
            boxed_double(process, x $op y)
        }
    };
}

double_binary!(native_double_add, +);
double_binary!(native_double_sub, -);
double_binary!(native_double_mul, *);
double_binary!(native_double_div, /);
double_binary!(native_double_mod, %);

fn native_double_negate(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_number(process, args[0]));
    boxed_double(process, -x)
}

macro_rules! double_compare {
    ($name:ident, $op:tt) => {
        fn $name(process: &mut Process, args: &[Value]) -> NativeResult {
            let x = try_native!(as_number(process, args[0]));
            let y = try_native!(as_number(process, args[1]));
            bool_object(process, x $op y)
        }
    };
}

double_compare!(native_double_equal, ==);
double_compare!(native_double_less, <);
double_compare!(native_double_less_equal, <=);
double_compare!(native_double_greater, >);
double_compare!(native_double_greater_equal, >=);

fn native_double_is_nan(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_number(process, args[0]));
    bool_object(process, x.is_nan())
}

// ── Strings ────────────────────────────────────────────────────────

fn native_string_length(process: &mut Process, args: &[Value]) -> NativeResult {
    let s = try_native!(as_string(process, args[0]));
    Done(Value::from_smi(s.len() as i64))
}

fn native_string_code_unit_at(process: &mut Process, args: &[Value]) -> NativeResult {
    let s = try_native!(as_string(process, args[0]));
    let index = try_native!(as_smi(args[1]));
    if index < 0 || index as usize >= s.len() {
        return Failure(Value::INDEX_OUT_OF_BOUNDS);
    }
    // SAFETY: bounds-checked.
    let unit = unsafe { s.code_units()[index as usize] };
    Done(Value::from_smi(unit as i64))
}

fn native_string_equal(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_string(process, args[0]));
    let equal = match as_string(process, args[1]) {
        Ok(y) => {
            // SAFETY: live strings.
            unsafe { x.code_units() == y.code_units() }
        }
        Err(_) => false,
    };
    bool_object(process, equal)
}

fn native_string_add(process: &mut Process, args: &[Value]) -> NativeResult {
    let x = try_native!(as_string(process, args[0]));
    let y = try_native!(as_string(process, args[1]));
    // SAFETY: live strings; copied before any allocation can move them
    // (strings never move, they live in the immutable heap, but the
    // buffer also guards against a retried allocation).
    let mut units = unsafe { x.code_units().to_vec() };
    unsafe { units.extend_from_slice(y.code_units()) };
    let result = process.new_string_from_units(&units);
    if result.is_failure() {
        Failure(result)
    } else {
        Done(result)
    }
}

// ── Arrays ─────────────────────────────────────────────────────────

fn native_array_new(process: &mut Process, args: &[Value]) -> NativeResult {
    let length = try_native!(as_smi(args[1]));
    if length < 0 {
        return Failure(Value::INDEX_OUT_OF_BOUNDS);
    }
    let result = process.new_array(length as usize);
    if result.is_failure() {
        Failure(result)
    } else {
        Done(result)
    }
}

fn native_array_length(process: &mut Process, args: &[Value]) -> NativeResult {
    let array = try_native!(as_array_mut(process, args[0]));
    Done(Value::from_smi(array.len() as i64))
}

fn native_array_index_get(process: &mut Process, args: &[Value]) -> NativeResult {
    let array = try_native!(as_array_mut(process, args[0]));
    let index = try_native!(as_smi(args[1]));
    if index < 0 || index as usize >= array.len() {
        return Failure(Value::INDEX_OUT_OF_BOUNDS);
    }
    // SAFETY: bounds-checked.
    Done(unsafe { array.get_unchecked(index as usize) })
}

fn native_array_index_set(process: &mut Process, args: &[Value]) -> NativeResult {
    let array = try_native!(as_array_mut(process, args[0]));
    let index = try_native!(as_smi(args[1]));
    if index < 0 || index as usize >= array.len() {
        return Failure(Value::INDEX_OUT_OF_BOUNDS);
    }
    let value = args[2];
    // SAFETY: bounds-checked.
    unsafe { array.set_unchecked(index as usize, value) };
    process.record_store(args[0], value);
    Done(value)
}

// ── Processes and ports ────────────────────────────────────────────

fn function_for_closure(
    process: &Process,
    closure: Value,
    arity: u8,
) -> Option<Value> {
    let class = process.program.class_of(closure);
    process
        .program
        .lookup_method(class, Selector::method(CALL_ID, arity))
}

/// `Process._spawn(entrypoint, closure, argument)`: both the closure and
/// the argument (when non-null) must be immutable.
fn native_process_spawn(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    let null = program.specials().null_object;
    let entrypoint = args[1];
    let closure = args[2];
    let argument = args[3];

    // SAFETY: stack-held values are live.
    if !unsafe { value_is_immutable(closure) } {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    let has_argument = argument != null;
    // SAFETY: stack-held values are live.
    if has_argument && !unsafe { value_is_immutable(argument) } {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    if function_for_closure(process, closure, 1).is_none() {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    let Some(entry) = function_for_closure(process, entrypoint, 2) else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };

    let child = program.spawn_process();
    // SAFETY: freshly spawned; not yet visible to the scheduler.
    unsafe {
        let child_ref = &mut *child.as_ptr();
        child_ref.setup_execution_stack();
        let bcp = entry.as_ref::<Function>().bytecode_address(0);
        let stack = child_ref.stack_mut();
        // A pending call of the entry: receiver (unused tear-off hole),
        // the closure, the argument, the terminating return address and
        // the entry bytecode pointer.
        stack.set(0, null);
        stack.set(1, closure);
        stack.set(2, argument);
        stack.set(3, Value::from_raw(0));
        stack.set(4, Value::from_raw(bcp as u64));
        stack.set_top(4);
        // The seeded stack holds immutable references.
        child_ref
            .store_buffer
            .insert(child_ref.stack_value().ref_bits() as *mut u8);
    }

    if let Some(scheduler) = program.scheduler() {
        scheduler.enqueue_spawned(child);
    }
    Done(null)
}

/// Non-blocking receive: the sentinel means "queue empty", and the
/// surrounding code yields and retries.
fn native_process_queue_get_message(
    process: &mut Process,
    _args: &[Value],
) -> NativeResult {
    match process.dequeue_message() {
        Some(message) => Done(message.value()),
        None => Done(process.program.specials().sentinel_object),
    }
}

fn native_process_link_port(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    // SAFETY: reified ports hold a live reference.
    let Some(port) = (unsafe { PortHandle::from_value(&program, args[1]) })
    else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };
    process.add_link(port.upgrade());
    Done(program.specials().null_object)
}

fn native_port_create(process: &mut Process, _args: &[Value]) -> NativeResult {
    let handle = PortHandle::new(NonNull::from(&mut *process));
    process.register_port(handle.clone());
    let reified = handle.reify(process);
    if reified.is_failure() {
        Failure(reified)
    } else {
        Done(reified)
    }
}

/// `send` enqueues and, through the yield bytecode, hands control to the
/// receiver. Messages must be immutable.
fn native_port_send(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    let port_value = args[0];
    let message = args[1];
    // SAFETY: stack-held values are live.
    if !unsafe { value_is_immutable(message) } {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    // SAFETY: reified ports hold a live reference.
    let Some(port) = (unsafe { PortHandle::from_value(&program, port_value) })
    else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };
    if port.send(message) {
        // Non-null result: the interpreter target-yields to this port.
        Done(port_value)
    } else {
        Done(program.specials().null_object)
    }
}

fn native_port_send_exit(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    let port_value = args[0];
    let reason = args[1];
    // SAFETY: stack-held values are live.
    if !unsafe { value_is_immutable(reason) } {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    // SAFETY: reified ports hold a live reference.
    let Some(port) = (unsafe { PortHandle::from_value(&program, port_value) })
    else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };
    if port.send_exit(reason) {
        Done(port_value)
    } else {
        Done(program.specials().null_object)
    }
}

fn native_port_increment_ref(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    // SAFETY: reified ports hold a live reference.
    let Some(port) = (unsafe { PortHandle::from_value(&program, args[0]) })
    else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };
    port.increment_ref();
    Done(program.specials().null_object)
}

fn native_port_decrement_ref(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    // SAFETY: reified ports hold a live reference.
    let Some(port) = (unsafe { PortHandle::from_value(&program, args[0]) })
    else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };
    port.decrement_ref();
    Done(program.specials().null_object)
}

// ── Coroutines ─────────────────────────────────────────────────────

/// Create a coroutine around `entry` (a closure with a `call` method),
/// seeding a fresh stack that resumes inside `coroutineStart` right at
/// its first coroutine-change.
fn native_coroutine_new(process: &mut Process, args: &[Value]) -> NativeResult {
    let program = process.program.clone();
    let entry = args[1];

    let coroutine_class = program.specials().coroutine_class;
    let Some(start) = program.lookup_method(
        coroutine_class,
        Selector::method(COROUTINE_START_ID, 1),
    ) else {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    };

    let stack_value = process.new_stack(256);
    if stack_value.is_failure() {
        return Failure(stack_value);
    }
    let coroutine = process.new_coroutine(stack_value);
    if coroutine.is_failure() {
        return Failure(coroutine);
    }
    // The creator becomes the caller, so completion and unwinding return
    // here.
    // SAFETY: fresh coroutine object.
    unsafe {
        (*coroutine.as_mut_ptr::<Coroutine>()).caller = process.coroutine();
    }

    // SAFETY: live function; the builder pins the prologue shape.
    let bcp = unsafe { start.as_ref::<Function>().bytecode_address(0) };
    debug_assert_eq!(unsafe { *bcp }, bytecode::Op::LoadLiteral0 as u8);
    debug_assert_eq!(unsafe { *bcp.add(1) }, bytecode::Op::LoadLiteral0 as u8);
    debug_assert_eq!(
        unsafe { *bcp.add(2) },
        bytecode::Op::CoroutineChange as u8
    );

    // SAFETY: fresh stack with 256 slots.
    unsafe {
        let stack = &mut *stack_value.as_mut_ptr::<Stack>();
        stack.set(0, coroutine);
        stack.set(1, entry);
        stack.set(2, Value::from_raw(0)); // terminating return address
        stack.set(3, Value::from_smi(0)); // fake 'coroutine' argument
        stack.set(4, Value::from_smi(0)); // fake 'value' argument
        // Leave the bytecode pointer at the coroutine-change so the
        // first switch in looks like a resume.
        stack.set(5, Value::from_raw(bcp.add(2) as u64));
        stack.set_top(5);
    }
    // The seeded stack may hold immutable references (the entry closure).
    process
        .store_buffer
        .insert(stack_value.ref_bits() as *mut u8);

    Done(coroutine)
}

fn native_coroutine_current(process: &mut Process, _args: &[Value]) -> NativeResult {
    Done(process.coroutine())
}

fn native_coroutine_caller(process: &mut Process, args: &[Value]) -> NativeResult {
    let value = args[0];
    if !value.is_ref() {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    // SAFETY: live object.
    let class = unsafe { value.as_ref::<object::HeapHeader>().class_value() };
    if class != process.program.specials().coroutine_class {
        return Failure(Value::WRONG_ARGUMENT_TYPE);
    }
    // SAFETY: checked.
    Done(unsafe { value.as_ref::<Coroutine>() }.caller)
}

// ── Stopwatch / reflection ─────────────────────────────────────────

fn native_stopwatch_frequency(_process: &mut Process, _args: &[Value]) -> NativeResult {
    Done(Value::from_smi(1_000_000))
}

fn native_stopwatch_now(process: &mut Process, _args: &[Value]) -> NativeResult {
    let micros = process.program.elapsed_micros();
    boxed_integer(process, micros)
}

fn native_is_immutable(process: &mut Process, args: &[Value]) -> NativeResult {
    // SAFETY: stack-held values are live.
    bool_object(process, unsafe { value_is_immutable(args[0]) })
}
