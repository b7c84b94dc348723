use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use object::{Function, Selector, Value};
use parking_lot::Mutex;

use crate::process::{Breakpoint, DebugInfo, Process};
use crate::program::Program;
use crate::scheduler::Scheduler;
use crate::snapshot;
use crate::stack_walker::StackWalker;

/// Wire opcodes of the live-coding session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionOpcode {
    ConnectionError = 0,
    CompilerError,
    SessionEnd,
    Debugging,
    DisableStandardOutput,
    StdoutData,
    StderrData,

    ProcessSpawnForMain,
    ProcessRun,
    ProcessSetBreakpoint,
    ProcessDeleteBreakpoint,
    ProcessStep,
    ProcessStepOver,
    ProcessStepOut,
    ProcessStepTo,
    ProcessContinue,
    ProcessBacktraceRequest,
    ProcessFiberBacktraceRequest,
    ProcessBacktrace,
    ProcessBreakpoint,
    ProcessLocal,
    ProcessLocalStructure,
    ProcessRestartFrame,
    ProcessTerminated,
    ProcessNumberOfStacks,

    WriteSnapshot,
    CollectGarbage,

    PrepareForChanges,
    ChangeSuperClass,
    ChangeMethodTable,
    ChangeMethodLiteral,
    ChangeStatics,
    ChangeSchemas,
    CommitChanges,
    CommitChangesResult,
    DiscardChanges,

    UncaughtException,
}

impl SessionOpcode {
    pub const COUNT: usize = Self::UncaughtException as usize + 1;

    pub fn from_u8(byte: u8) -> Option<Self> {
        ((byte as usize) < Self::COUNT)
            // SAFETY: bounds-checked.
            .then(|| unsafe { core::mem::transmute::<u8, SessionOpcode>(byte) })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(&'static str),
    #[error("snapshot: {0}")]
    Snapshot(#[from] snapshot::SnapshotError),
}

// ── Wire codec ─────────────────────────────────────────────────────

/// One received message: opcode plus a length-delimited payload of
/// little-endian primitives.
pub struct MessageReader {
    payload: Vec<u8>,
    position: usize,
}

impl MessageReader {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload, position: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&[u8], SessionError> {
        if self.position + count > self.payload.len() {
            return Err(SessionError::Protocol("payload underrun"));
        }
        let slice = &self.payload[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_i32(&mut self) -> Result<i32, SessionError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, SessionError> {
        let bytes = self.take(8)?;
        let mut buffer = [0u8; 8];
        buffer.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buffer))
    }

    pub fn read_double(&mut self) -> Result<f64, SessionError> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    pub fn read_boolean(&mut self) -> Result<bool, SessionError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, SessionError> {
        let length = self.read_i32()? as usize;
        Ok(self.take(length)?.to_vec())
    }

    /// Length-prefixed UTF-16 string.
    pub fn read_string(&mut self) -> Result<String, SessionError> {
        let length = self.read_i32()? as usize;
        let bytes = self.take(length * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }
}

/// Builds one outgoing message.
pub struct MessageWriter {
    payload: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self { payload: Vec::new() }
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_double(&mut self, value: f64) -> &mut Self {
        self.write_i64(value.to_bits() as i64)
    }

    pub fn write_boolean(&mut self, value: bool) -> &mut Self {
        self.payload.push(value as u8);
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_i32(bytes.len() as i32);
        self.payload.extend_from_slice(bytes);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_i32(units.len() as i32);
        for unit in units {
            self.payload.extend_from_slice(&unit.to_le_bytes());
        }
        self
    }
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared write half; interceptors and the serve loop both send.
#[derive(Clone)]
struct Connection {
    stream: Arc<Mutex<TcpStream>>,
}

impl Connection {
    fn send(&self, opcode: SessionOpcode, message: &MessageWriter) -> Result<(), SessionError> {
        let mut stream = self.stream.lock();
        stream.write_all(&[opcode as u8])?;
        stream.write_all(&(message.payload.len() as u32).to_le_bytes())?;
        stream.write_all(&message.payload)?;
        Ok(())
    }

    fn receive(
        stream: &mut TcpStream,
    ) -> Result<(SessionOpcode, MessageReader), SessionError> {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header)?;
        let opcode = SessionOpcode::from_u8(header[0])
            .ok_or(SessionError::Protocol("unknown opcode"))?;
        let length =
            u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        let mut payload = vec![0u8; length as usize];
        stream.read_exact(&mut payload)?;
        Ok((opcode, MessageReader::new(payload)))
    }
}

/// A staged program mutation, applied on commit.
enum Change {
    SuperClass { class: usize, superclass: usize },
    MethodTable { class: usize, methods: Vec<(Selector, usize)> },
    MethodLiteral { function: usize, slot: usize, value: Value },
    Statics { template: Value },
    Schema { class: usize, fields: usize },
}

/// A live-coding session over one TCP connection.
pub struct Session {
    program: Arc<Program>,
    connection: Connection,
    read_stream: TcpStream,
    scheduler: Scheduler,
    main_process: Option<NonNull<Process>>,
    changes: Vec<Change>,
    prepared: bool,
    running: Arc<AtomicBool>,
    breakpoints: mpsc::Receiver<SendProcessPtr>,
    breakpoint_sender: mpsc::Sender<SendProcessPtr>,
    run_thread: Option<std::thread::JoinHandle<i32>>,
}

// SAFETY: processes referenced by the session are parked while touched.
unsafe impl Send for Session {}

/// Carries a process pointer across the run-thread boundary.
///
/// SAFETY: ownership is handed off to the scheduler thread, which is the
/// sole accessor until the run completes.
struct SendProcessPtr(NonNull<Process>);
unsafe impl Send for SendProcessPtr {}

impl SendProcessPtr {
    fn get(self) -> NonNull<Process> {
        self.0
    }
}

impl Session {
    /// Block until a debugger connects on `port`.
    pub fn wait_for_connection(
        program: Arc<Program>,
        port: u16,
    ) -> Result<Session, SessionError> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let (stream, _addr) = listener.accept()?;
        Self::attach(program, stream)
    }

    pub fn attach(
        program: Arc<Program>,
        stream: TcpStream,
    ) -> Result<Session, SessionError> {
        let read_stream = stream.try_clone()?;
        let connection = Connection { stream: Arc::new(Mutex::new(stream)) };
        let scheduler = Scheduler::new(
            program.clone(),
            std::thread::available_parallelism().map_or(2, |n| n.get()),
        );
        let (sender, receiver) = mpsc::channel();

        // Program output is forwarded as stdout-data messages.
        {
            let connection = connection.clone();
            program.set_print_interceptor(Some(Box::new(move |text| {
                let mut message = MessageWriter::new();
                message.write_bytes(text.as_bytes());
                let _ = connection.send(SessionOpcode::StdoutData, &message);
            })));
        }

        Ok(Session {
            program,
            connection,
            read_stream,
            scheduler,
            main_process: None,
            changes: Vec::new(),
            prepared: false,
            running: Arc::new(AtomicBool::new(false)),
            breakpoints: receiver,
            breakpoint_sender: sender,
            run_thread: None,
        })
    }

    /// Serve requests until session-end or disconnect.
    pub fn serve(mut self) -> Result<i32, SessionError> {
        let mut stream = self.read_stream.try_clone()?;
        loop {
            // Forward any breakpoint notifications first.
            while let Ok(process) = self.breakpoints.try_recv() {
                self.notify_breakpoint(process.get())?;
            }

            let (opcode, mut reader) = match Connection::receive(&mut stream) {
                Ok(message) => message,
                Err(SessionError::Io(_)) => break,
                Err(error) => return Err(error),
            };
            tracing::debug!(target: "session", ?opcode, "request");

            match opcode {
                SessionOpcode::SessionEnd => break,
                SessionOpcode::Debugging => {}
                SessionOpcode::DisableStandardOutput => {
                    self.program.set_stdout_enabled(false);
                }
                SessionOpcode::ProcessSpawnForMain => {
                    let process = self.program.spawn_process_for_main();
                    // SAFETY: freshly spawned, unshared.
                    unsafe {
                        (*process.as_ptr()).debug_info =
                            Some(Box::new(DebugInfo::default()));
                    }
                    self.main_process = Some(process);
                }
                SessionOpcode::ProcessRun => self.start_run(),
                SessionOpcode::ProcessSetBreakpoint => {
                    let function = reader.read_i32()? as usize;
                    let bytecode_index = reader.read_i32()? as usize;
                    let one_shot = reader.read_boolean()?;
                    let id = self.set_breakpoint(
                        function,
                        bytecode_index,
                        one_shot,
                    )?;
                    let mut message = MessageWriter::new();
                    message.write_i32(id as i32);
                    self.connection
                        .send(SessionOpcode::ProcessSetBreakpoint, &message)?;
                }
                SessionOpcode::ProcessDeleteBreakpoint => {
                    let id = reader.read_i32()? as u32;
                    self.with_main(|process| {
                        if let Some(info) = process.debug_info.as_mut() {
                            info.delete_breakpoint(id);
                        }
                    });
                    let mut message = MessageWriter::new();
                    message.write_i32(id as i32);
                    self.connection
                        .send(SessionOpcode::ProcessDeleteBreakpoint, &message)?;
                }
                SessionOpcode::ProcessStep => {
                    self.with_main(|process| {
                        if let Some(info) = process.debug_info.as_mut() {
                            info.is_stepping = true;
                        }
                    });
                    self.resume_main();
                }
                SessionOpcode::ProcessStepOver
                | SessionOpcode::ProcessStepOut => {
                    // One-shot break at the frame boundary: the return
                    // address of the current (or caller) frame.
                    let out = opcode == SessionOpcode::ProcessStepOut;
                    self.step_to_frame_boundary(out)?;
                    self.resume_main();
                }
                SessionOpcode::ProcessStepTo => {
                    let function = reader.read_i32()? as usize;
                    let bytecode_index = reader.read_i32()? as usize;
                    self.set_breakpoint(function, bytecode_index, true)?;
                    self.resume_main();
                }
                SessionOpcode::ProcessContinue => {
                    self.with_main(|process| {
                        if let Some(info) = process.debug_info.as_mut() {
                            info.is_stepping = false;
                        }
                    });
                    self.resume_main();
                }
                SessionOpcode::ProcessBacktraceRequest => {
                    let message = self.backtrace()?;
                    self.connection
                        .send(SessionOpcode::ProcessBacktrace, &message)?;
                }
                SessionOpcode::ProcessFiberBacktraceRequest => {
                    // The backtrace of the selected coroutine; the
                    // payload picks the fiber counted from the current.
                    let _fiber = reader.read_i32()?;
                    let message = self.backtrace()?;
                    self.connection
                        .send(SessionOpcode::ProcessBacktrace, &message)?;
                }
                SessionOpcode::ProcessLocal => {
                    let frame = reader.read_i32()? as usize;
                    let slot = reader.read_i32()? as usize;
                    let message = self.local(frame, slot)?;
                    self.connection.send(SessionOpcode::ProcessLocal, &message)?;
                }
                SessionOpcode::ProcessLocalStructure => {
                    let frame = reader.read_i32()? as usize;
                    let slot = reader.read_i32()? as usize;
                    let message = self.local_structure(frame, slot)?;
                    self.connection
                        .send(SessionOpcode::ProcessLocalStructure, &message)?;
                }
                SessionOpcode::ProcessRestartFrame => {
                    let frame = reader.read_i32()? as usize;
                    self.restart_frame(frame)?;
                    self.resume_main();
                }
                SessionOpcode::ProcessNumberOfStacks => {
                    let count = self.number_of_stacks();
                    let mut message = MessageWriter::new();
                    message.write_i32(count as i32);
                    self.connection
                        .send(SessionOpcode::ProcessNumberOfStacks, &message)?;
                }
                SessionOpcode::WriteSnapshot => {
                    let path = reader.read_string()?;
                    snapshot::write_to_file(
                        &self.program,
                        std::path::Path::new(&path),
                    )?;
                }
                SessionOpcode::CollectGarbage => {
                    self.collect_garbage();
                }
                SessionOpcode::PrepareForChanges => {
                    if self.running.load(Ordering::SeqCst) {
                        self.scheduler.stop_program();
                    }
                    self.prepared = true;
                }
                SessionOpcode::ChangeSuperClass => {
                    let class = reader.read_i32()? as usize;
                    let superclass = reader.read_i32()? as usize;
                    self.changes.push(Change::SuperClass { class, superclass });
                }
                SessionOpcode::ChangeMethodTable => {
                    let class = reader.read_i32()? as usize;
                    let count = reader.read_i32()? as usize;
                    let mut methods = Vec::with_capacity(count);
                    for _ in 0..count {
                        let selector =
                            Selector::from_raw(reader.read_i32()? as u32);
                        let function = reader.read_i32()? as usize;
                        methods.push((selector, function));
                    }
                    self.changes.push(Change::MethodTable { class, methods });
                }
                SessionOpcode::ChangeMethodLiteral => {
                    let function = reader.read_i32()? as usize;
                    let slot = reader.read_i32()? as usize;
                    let bytes = reader.read_bytes()?;
                    let literal =
                        snapshot_literal(&self.program, &bytes)?;
                    self.changes.push(Change::MethodLiteral {
                        function,
                        slot,
                        value: literal,
                    });
                }
                SessionOpcode::ChangeStatics => {
                    let bytes = reader.read_bytes()?;
                    let template = statics_template(&self.program, &bytes)?;
                    self.changes.push(Change::Statics { template });
                }
                SessionOpcode::ChangeSchemas => {
                    let class = reader.read_i32()? as usize;
                    let fields = reader.read_i32()? as usize;
                    self.changes.push(Change::Schema { class, fields });
                }
                SessionOpcode::CommitChanges => {
                    let success = self.commit_changes();
                    let mut message = MessageWriter::new();
                    message.write_boolean(success);
                    self.connection
                        .send(SessionOpcode::CommitChangesResult, &message)?;
                }
                SessionOpcode::DiscardChanges => {
                    self.changes.clear();
                    self.finish_changes();
                }
                SessionOpcode::ProcessBreakpoint
                | SessionOpcode::ProcessBacktrace
                | SessionOpcode::ProcessTerminated
                | SessionOpcode::CommitChangesResult
                | SessionOpcode::StdoutData
                | SessionOpcode::StderrData
                | SessionOpcode::UncaughtException
                | SessionOpcode::ConnectionError
                | SessionOpcode::CompilerError => {
                    return Err(SessionError::Protocol("response opcode sent"))
                }
            }

            if let Some(result) = self.try_finish_run()? {
                self.program.set_print_interceptor(None);
                return Ok(result);
            }
        }
        self.program.set_print_interceptor(None);
        Ok(self.join_run())
    }

    // ── Run / breakpoint plumbing ──────────────────────────────────

    fn start_run(&mut self) {
        let Some(main) = self.main_process else { return };
        let scheduler = self.scheduler.clone();
        let sender = self.breakpoint_sender.clone();
        scheduler.set_breakpoint_sink(Some(Box::new(move |process| {
            let _ = sender.send(SendProcessPtr(process));
        })));
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let thread_scheduler = self.scheduler.clone();
        let main = SendProcessPtr(main);
        self.run_thread = Some(std::thread::spawn(move || {
            let result = thread_scheduler.run(main.get());
            running.store(false, Ordering::SeqCst);
            result
        }));
    }

    fn try_finish_run(&mut self) -> Result<Option<i32>, SessionError> {
        if self.run_thread.is_some() && !self.running.load(Ordering::SeqCst) {
            let result = self.join_run();
            let mut message = MessageWriter::new();
            message.write_i32(result);
            let opcode = if result == 0 {
                SessionOpcode::ProcessTerminated
            } else {
                SessionOpcode::UncaughtException
            };
            self.connection.send(opcode, &message)?;
            return Ok(Some(result));
        }
        Ok(None)
    }

    fn join_run(&mut self) -> i32 {
        self.run_thread.take().map_or(0, |thread| thread.join().unwrap_or(255))
    }

    fn notify_breakpoint(&mut self, process: NonNull<Process>) -> Result<(), SessionError> {
        self.main_process = Some(process);
        let mut message = MessageWriter::new();
        // Report the innermost frame.
        // SAFETY: parked at a breakpoint; the session owns it.
        let process_ref = unsafe { &mut *process.as_ptr() };
        let stack = process_ref.stack();
        let mut walker = StackWalker::new(&self.program, stack);
        if let Some(frame) = walker.move_next() {
            let index = self
                .program
                .functions()
                .iter()
                .position(|&f| f == frame.function)
                .unwrap_or(0);
            // SAFETY: live function.
            let start = unsafe {
                frame.function.as_ref::<Function>().bytecode_address(0)
            };
            message.write_i32(index as i32);
            message.write_i32((frame.bcp as usize - start as usize) as i32);
        }
        self.connection.send(SessionOpcode::ProcessBreakpoint, &message)
    }

    fn with_main(&mut self, f: impl FnOnce(&mut Process)) {
        if let Some(process) = self.main_process {
            // SAFETY: parked; the session owns it.
            f(unsafe { &mut *process.as_ptr() });
        }
    }

    fn resume_main(&mut self) {
        if let Some(process) = self.main_process {
            self.scheduler.process_continue(process);
        }
    }

    fn set_breakpoint(
        &mut self,
        function: usize,
        bytecode_index: usize,
        one_shot: bool,
    ) -> Result<u32, SessionError> {
        let function = *self
            .program
            .functions()
            .get(function)
            .ok_or(SessionError::Protocol("function index"))?;
        let mut id = 0;
        self.with_main(|process| {
            let info = process
                .debug_info
                .get_or_insert_with(|| Box::new(DebugInfo::default()));
            id = info.set_breakpoint(Breakpoint {
                id: 0,
                function,
                bytecode_index,
                one_shot,
                coroutine: None,
                stack_height: None,
            });
        });
        Ok(id)
    }

    fn step_to_frame_boundary(&mut self, out: bool) -> Result<(), SessionError> {
        let program = self.program.clone();
        let Some(process) = self.main_process else {
            return Ok(());
        };
        // SAFETY: parked.
        let process_ref = unsafe { &mut *process.as_ptr() };
        let stack = process_ref.stack();
        let mut walker = StackWalker::new(&program, stack);
        let mut frame = walker.move_next();
        if out {
            frame = walker.move_next();
        }
        let Some(frame) = frame else { return Ok(()) };
        // Break at the frame's return address (the caller's pending pc).
        let Some(caller) = walker.move_next() else {
            return Ok(());
        };
        // SAFETY: live function.
        let start =
            unsafe { caller.function.as_ref::<Function>().bytecode_address(0) };
        let pc = caller.bcp as usize - start as usize;
        let _ = frame;
        let function_index = self
            .program
            .functions()
            .iter()
            .position(|&f| f == caller.function)
            .ok_or(SessionError::Protocol("caller function"))?;
        self.set_breakpoint(function_index, pc, true)?;
        Ok(())
    }

    fn backtrace(&mut self) -> Result<MessageWriter, SessionError> {
        let mut message = MessageWriter::new();
        let Some(process) = self.main_process else {
            message.write_i32(0);
            return Ok(message);
        };
        // SAFETY: parked.
        let process_ref = unsafe { &*process.as_ptr() };
        let stack = process_ref.stack();
        let mut frames = Vec::new();
        let mut walker = StackWalker::new(&self.program, stack);
        while let Some(frame) = walker.move_next() {
            let index = self
                .program
                .functions()
                .iter()
                .position(|&f| f == frame.function)
                .unwrap_or(0);
            // SAFETY: live function.
            let start = unsafe {
                frame.function.as_ref::<Function>().bytecode_address(0)
            };
            frames.push((index, frame.bcp as usize - start as usize));
        }
        message.write_i32(frames.len() as i32);
        for (function, pc) in frames {
            message.write_i32(function as i32);
            message.write_i32(pc as i32);
        }
        Ok(message)
    }

    fn local(&mut self, frame_index: usize, slot: usize) -> Result<MessageWriter, SessionError> {
        let value = self.local_value(frame_index, slot)?;
        let mut message = MessageWriter::new();
        message.write_string(&crate::interpreter::short_print(&self.program, value));
        Ok(message)
    }

    fn local_structure(
        &mut self,
        frame_index: usize,
        slot: usize,
    ) -> Result<MessageWriter, SessionError> {
        let value = self.local_value(frame_index, slot)?;
        let mut message = MessageWriter::new();
        if value.is_smi() {
            // SAFETY: checked.
            message.write_i32(0).write_i64(unsafe { value.to_smi() });
        } else {
            // Class id plus rendering.
            let class = self.program.class_of(value);
            // SAFETY: live class.
            let id = unsafe { class.as_ref::<object::Class>() }.id();
            message.write_i32(1).write_i64(id);
            message.write_string(&crate::interpreter::short_print(
                &self.program,
                value,
            ));
        }
        Ok(message)
    }

    fn local_value(&mut self, frame_index: usize, slot: usize) -> Result<Value, SessionError> {
        let process = self
            .main_process
            .ok_or(SessionError::Protocol("no process"))?;
        // SAFETY: parked.
        let process_ref = unsafe { &*process.as_ptr() };
        let stack = process_ref.stack();
        let mut walker = StackWalker::new(&self.program, stack);
        let mut current = 0;
        while let Some(frame) = walker.move_next() {
            if current == frame_index {
                let base = frame.bcp_slot - frame.frame_size;
                if slot >= frame.frame_size {
                    return Err(SessionError::Protocol("slot out of frame"));
                }
                // SAFETY: live slot.
                return Ok(unsafe { stack.get(base + slot) });
            }
            current += 1;
        }
        Err(SessionError::Protocol("frame out of range"))
    }

    fn restart_frame(&mut self, frame_index: usize) -> Result<(), SessionError> {
        let process = self
            .main_process
            .ok_or(SessionError::Protocol("no process"))?;
        // SAFETY: parked.
        let process_ref = unsafe { &mut *process.as_ptr() };
        let program = self.program.clone();
        let stack = process_ref.stack();
        let mut walker = StackWalker::new(&program, stack);
        let mut current = 0;
        let mut target = None;
        while let Some(frame) = walker.move_next() {
            if current == frame_index {
                target = Some(frame);
                break;
            }
            current += 1;
        }
        let frame =
            target.ok_or(SessionError::Protocol("frame out of range"))?;
        if frame_index == 0 {
            return Ok(()); // already at the top; resume re-executes
        }
        // Rewind the caller's return address back onto the invoke and
        // make it the new top of stack; the invoke re-runs on resume.
        let stack = process_ref.stack_mut();
        // SAFETY: frame slots are live.
        unsafe {
            let return_address = stack.get(frame.bcp_slot).raw();
            let invoke = return_address - 5; // all invokes are 5 bytes
            stack.set(frame.bcp_slot, Value::from_raw(invoke));
            stack.set_top(frame.bcp_slot);
        }
        Ok(())
    }

    fn number_of_stacks(&self) -> usize {
        let Some(process) = self.main_process else { return 0 };
        // SAFETY: parked.
        let process_ref = unsafe { &*process.as_ptr() };
        // Walk the coroutine caller chain.
        let mut count = 0;
        let mut current = process_ref.coroutine();
        while current.is_ref() {
            count += 1;
            // SAFETY: live coroutine.
            let coroutine = unsafe { current.as_ref::<object::Coroutine>() };
            if coroutine.caller == current
                || !coroutine.caller.is_ref()
                || coroutine.caller == self.program.specials().null_object
            {
                break;
            }
            current = coroutine.caller;
        }
        count
    }

    fn collect_garbage(&mut self) {
        let was_running = self.running.load(Ordering::SeqCst);
        if was_running {
            self.scheduler.stop_program();
        }
        self.program.each_process(&mut |process| {
            process.collect_mutable_garbage();
        });
        if was_running {
            self.scheduler.resume_program();
        }
    }

    // ── Program mutation ───────────────────────────────────────────

    fn commit_changes(&mut self) -> bool {
        if !self.prepared {
            return false;
        }
        let changes = core::mem::take(&mut self.changes);
        for change in changes {
            match change {
                Change::SuperClass { class, superclass } => {
                    let (Some(class), Some(superclass)) = (
                        checked_class(&self.program, class),
                        checked_class(&self.program, superclass),
                    ) else {
                        return false;
                    };
                    // SAFETY: program stopped.
                    unsafe {
                        (*class.as_mut_ptr::<object::Class>())
                            .set_superclass(superclass);
                    }
                }
                Change::MethodTable { class, methods } => {
                    let Some(class) = checked_class(&self.program, class)
                    else {
                        return false;
                    };
                    let table = self.program.create_array(
                        methods.len() * 2,
                        self.program.specials().null_object,
                    );
                    // SAFETY: fresh program array.
                    unsafe {
                        let array = table.as_mut_ptr::<object::Array>();
                        for (slot, (selector, function)) in
                            methods.iter().enumerate()
                        {
                            let Some(&function) =
                                self.program.functions().get(*function)
                            else {
                                return false;
                            };
                            (*array).set_unchecked(
                                slot * 2,
                                Value::from_smi(selector.raw() as i64),
                            );
                            (*array).set_unchecked(slot * 2 + 1, function);
                        }
                        (*class.as_mut_ptr::<object::Class>())
                            .set_methods(table);
                    }
                }
                Change::MethodLiteral { function, slot, value } => {
                    let Some(&function) =
                        self.program.functions().get(function)
                    else {
                        return false;
                    };
                    // SAFETY: program stopped; slot checked below.
                    unsafe {
                        let f = function.as_mut_ptr::<Function>();
                        let literals = (*f).literals_mut();
                        if slot >= literals.len() {
                            return false;
                        }
                        literals[slot] = value;
                    }
                }
                Change::Statics { template } => {
                    // SAFETY: program stopped.
                    unsafe { self.program.replace_statics_template(template) };
                }
                Change::Schema { class, fields } => {
                    let Some(class) = checked_class(&self.program, class)
                    else {
                        return false;
                    };
                    // New instances get the new shape; live instances keep
                    // the old one until they die.
                    // SAFETY: program stopped.
                    unsafe {
                        let class = &mut *class.as_mut_ptr::<object::Class>();
                        let methods = class.methods();
                        let superclass = class.superclass();
                        let id = class.id();
                        class.init(
                            self.program.specials().meta_class,
                            object::InstanceFormat::instance(fields),
                            superclass,
                            methods,
                            id,
                        );
                    }
                }
            }
        }

        // Invalidate every dispatch structure that could name an old
        // target: all primary caches are cleared wholesale and the
        // bytecode-embedded tables are rebuilt by a fresh fold.
        self.program.each_process(&mut |process| {
            process.lookup_cache.clear();
        });
        self.program.fold();
        self.finish_changes();
        true
    }

    fn finish_changes(&mut self) {
        self.prepared = false;
        if self.running.load(Ordering::SeqCst) {
            self.scheduler.resume_program();
        }
    }
}

fn checked_class(program: &Program, index: usize) -> Option<Value> {
    (index < program.class_count()).then(|| program.class_at(index))
}

/// Materialize a literal payload (snapshot descriptor encoding) into
/// program space.
fn snapshot_literal(program: &Arc<Program>, bytes: &[u8]) -> Result<Value, SessionError> {
    let mut input = bytes;
    let literal = snapshot::read_literal(&mut input)?;
    snapshot::materialize_detached_literal(program, &literal)
        .map_err(SessionError::from)
}

fn statics_template(program: &Arc<Program>, bytes: &[u8]) -> Result<Value, SessionError> {
    let mut input = bytes;
    let count = snapshot::read_u32(&mut input)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let literal = snapshot::read_literal(&mut input)?;
        values.push(snapshot::materialize_detached_literal(program, &literal)?);
    }
    let template =
        program.create_array(values.len(), program.specials().null_object);
    // SAFETY: fresh program array.
    unsafe {
        let array = template.as_mut_ptr::<object::Array>();
        for (index, value) in values.into_iter().enumerate() {
            (*array).set_unchecked(index, value);
        }
    }
    Ok(template)
}
