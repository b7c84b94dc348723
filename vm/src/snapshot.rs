use std::io::{self, Read, Write};
use std::sync::Arc;

use heap::HeapSettings;
use object::{
    Array, CatchRange, Class, Double, Function, HeapHeader, Initializer,
    InstanceFlags, InstanceFormat, LargeInteger, Selector, TypeTag, Value,
    VmString,
};

use crate::program::{Program, Specials};

pub const SNAPSHOT_MAGIC: [u8; 2] = [0xBE, 0xEF];
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid snapshot: {0}")]
    Invalid(&'static str),
}

fn invalid(message: &'static str) -> SnapshotError {
    SnapshotError::Invalid(message)
}

// ── Authoring model ────────────────────────────────────────────────

/// A serializable object-graph node: program constants, function
/// literals and statics are all described this way.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Smi(i64),
    LargeInteger(i64),
    Double(f64),
    Str(String),
    Null,
    True,
    False,
    /// The queue-empty marker object.
    Sentinel,
    Class(usize),
    Function(usize),
    Array(Vec<Literal>),
    ByteArray(Vec<u8>),
    Instance { class: usize, immutable: bool, fields: Vec<Literal> },
}

#[derive(Debug, Clone)]
pub struct ClassDesc {
    pub type_tag: TypeTag,
    /// Reference fields, for instance formats.
    pub fields: usize,
    pub superclass: Option<usize>,
    pub methods: Vec<(Selector, usize)>,
}

#[derive(Debug, Clone)]
pub struct FunctionDesc {
    pub arity: usize,
    pub literals: Vec<Literal>,
    pub catch_ranges: Vec<CatchRange>,
    pub code: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum StaticDesc {
    Value(Literal),
    Initializer(usize),
}

/// The class roles every snapshot designates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialRoles {
    pub meta: usize,
    pub null: usize,
    pub boolean: usize,
    pub smi: usize,
    pub large_integer: usize,
    pub double: usize,
    pub string: usize,
    pub array: usize,
    pub byte_array: usize,
    pub boxed: usize,
    pub stack: usize,
    pub coroutine: usize,
    pub function: usize,
    pub initializer: usize,
    pub port: usize,
    pub sentinel: usize,
    pub error: usize,
}

/// Builds program snapshots: the authoring side of the byte format,
/// used by tooling and tests.
pub struct ProgramBuilder {
    pub names: Vec<String>,
    pub classes: Vec<ClassDesc>,
    pub functions: Vec<FunctionDesc>,
    pub static_methods: Vec<usize>,
    pub constants: Vec<Literal>,
    pub statics: Vec<StaticDesc>,
    pub roles: SpecialRoles,
    pub trampoline: usize,
    pub entry: usize,
    pub main_arity: usize,
}

impl ProgramBuilder {
    pub fn empty() -> Self {
        Self {
            names: Vec::new(),
            classes: Vec::new(),
            functions: Vec::new(),
            static_methods: Vec::new(),
            constants: Vec::new(),
            statics: Vec::new(),
            roles: SpecialRoles::default(),
            trampoline: 0,
            entry: 0,
            main_arity: 0,
        }
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return index as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    pub fn add_class(&mut self, desc: ClassDesc) -> usize {
        self.classes.push(desc);
        self.classes.len() - 1
    }

    pub fn add_function(&mut self, desc: FunctionDesc) -> usize {
        self.functions.push(desc);
        self.functions.len() - 1
    }

    pub fn add_static_method(&mut self, function: usize) -> usize {
        self.static_methods.push(function);
        self.static_methods.len() - 1
    }

    pub fn add_constant(&mut self, literal: Literal) -> usize {
        self.constants.push(literal);
        self.constants.len() - 1
    }

    pub fn add_static(&mut self, desc: StaticDesc) -> usize {
        self.statics.push(desc);
        self.statics.len() - 1
    }

    pub fn add_method(&mut self, class: usize, selector: Selector, function: usize) {
        self.classes[class].methods.push((selector, function));
    }

    // ── Serialization ──────────────────────────────────────────────

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        write_u32(&mut out, SNAPSHOT_VERSION);

        write_u32(&mut out, self.names.len() as u32);
        for name in &self.names {
            write_bytes(&mut out, name.as_bytes());
        }

        write_u32(&mut out, self.classes.len() as u32);
        for class in &self.classes {
            out.push(class.type_tag as u8);
            write_u32(&mut out, class.fields as u32);
            write_i32(
                &mut out,
                class.superclass.map_or(-1, |index| index as i32),
            );
            write_u32(&mut out, class.methods.len() as u32);
            for &(selector, function) in &class.methods {
                write_u32(&mut out, selector.raw());
                write_u32(&mut out, function as u32);
            }
        }

        write_u32(&mut out, self.functions.len() as u32);
        for function in &self.functions {
            write_u32(&mut out, function.arity as u32);
            write_u32(&mut out, function.literals.len() as u32);
            for literal in &function.literals {
                write_literal(&mut out, literal);
            }
            write_u32(&mut out, function.catch_ranges.len() as u32);
            for range in &function.catch_ranges {
                write_u32(&mut out, range.start);
                write_u32(&mut out, range.end);
                write_u32(&mut out, range.handler);
                write_u32(&mut out, range.frame_offset);
            }
            write_bytes(&mut out, &function.code);
        }

        write_u32(&mut out, self.static_methods.len() as u32);
        for &function in &self.static_methods {
            write_u32(&mut out, function as u32);
        }

        write_u32(&mut out, self.constants.len() as u32);
        for constant in &self.constants {
            write_literal(&mut out, constant);
        }

        write_u32(&mut out, self.statics.len() as u32);
        for slot in &self.statics {
            match slot {
                StaticDesc::Value(literal) => {
                    out.push(0);
                    write_literal(&mut out, literal);
                }
                StaticDesc::Initializer(function) => {
                    out.push(1);
                    write_u32(&mut out, *function as u32);
                }
            }
        }

        let roles = &self.roles;
        for index in [
            roles.meta,
            roles.null,
            roles.boolean,
            roles.smi,
            roles.large_integer,
            roles.double,
            roles.string,
            roles.array,
            roles.byte_array,
            roles.boxed,
            roles.stack,
            roles.coroutine,
            roles.function,
            roles.initializer,
            roles.port,
            roles.sentinel,
            roles.error,
        ] {
            write_u32(&mut out, index as u32);
        }
        write_u32(&mut out, self.trampoline as u32);
        write_u32(&mut out, self.entry as u32);
        write_u32(&mut out, self.main_arity as u32);
        out
    }
}

fn write_literal(out: &mut Vec<u8>, literal: &Literal) {
    match literal {
        Literal::Smi(value) => {
            out.push(0);
            write_i64(out, *value);
        }
        Literal::LargeInteger(value) => {
            out.push(1);
            write_i64(out, *value);
        }
        Literal::Double(value) => {
            out.push(2);
            write_i64(out, value.to_bits() as i64);
        }
        Literal::Str(value) => {
            out.push(3);
            let units: Vec<u16> = value.encode_utf16().collect();
            write_u32(out, units.len() as u32);
            for unit in units {
                out.extend_from_slice(&unit.to_le_bytes());
            }
        }
        Literal::Null => out.push(4),
        Literal::True => out.push(5),
        Literal::False => out.push(6),
        Literal::Sentinel => out.push(7),
        Literal::Class(index) => {
            out.push(8);
            write_u32(out, *index as u32);
        }
        Literal::Function(index) => {
            out.push(9);
            write_u32(out, *index as u32);
        }
        Literal::Array(elements) => {
            out.push(10);
            write_u32(out, elements.len() as u32);
            for element in elements {
                write_literal(out, element);
            }
        }
        Literal::ByteArray(bytes) => {
            out.push(11);
            write_bytes(out, bytes);
        }
        Literal::Instance { class, immutable, fields } => {
            out.push(12);
            write_u32(out, *class as u32);
            out.push(*immutable as u8);
            write_u32(out, fields.len() as u32);
            for field in fields {
                write_literal(out, field);
            }
        }
    }
}

pub fn read_literal(input: &mut impl Read) -> Result<Literal, SnapshotError> {
    Ok(match read_u8(input)? {
        0 => Literal::Smi(read_i64(input)?),
        1 => Literal::LargeInteger(read_i64(input)?),
        2 => Literal::Double(f64::from_bits(read_i64(input)? as u64)),
        3 => {
            let count = read_u32(input)? as usize;
            let mut units = Vec::with_capacity(count);
            for _ in 0..count {
                let mut buffer = [0u8; 2];
                input.read_exact(&mut buffer)?;
                units.push(u16::from_le_bytes(buffer));
            }
            Literal::Str(String::from_utf16_lossy(&units))
        }
        4 => Literal::Null,
        5 => Literal::True,
        6 => Literal::False,
        7 => Literal::Sentinel,
        8 => Literal::Class(read_u32(input)? as usize),
        9 => Literal::Function(read_u32(input)? as usize),
        10 => {
            let count = read_u32(input)? as usize;
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                elements.push(read_literal(input)?);
            }
            Literal::Array(elements)
        }
        11 => Literal::ByteArray(read_byte_list(input)?),
        12 => {
            let class = read_u32(input)? as usize;
            let immutable = read_u8(input)? != 0;
            let count = read_u32(input)? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                fields.push(read_literal(input)?);
            }
            Literal::Instance { class, immutable, fields }
        }
        _ => return Err(invalid("unknown literal tag")),
    })
}

// ── Reading into a builder ─────────────────────────────────────────

/// Parse a snapshot byte stream back into the authoring model.
pub fn parse(bytes: &[u8]) -> Result<ProgramBuilder, SnapshotError> {
    let mut input = bytes;
    let input = &mut input;

    let mut magic = [0u8; 2];
    input.read_exact(&mut magic)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(invalid("bad magic"));
    }
    if read_u32(input)? != SNAPSHOT_VERSION {
        return Err(invalid("unsupported version"));
    }

    let mut builder = ProgramBuilder::empty();

    let name_count = read_u32(input)? as usize;
    for _ in 0..name_count {
        let bytes = read_byte_list(input)?;
        builder.names.push(
            String::from_utf8(bytes).map_err(|_| invalid("name not utf-8"))?,
        );
    }

    let class_count = read_u32(input)? as usize;
    for _ in 0..class_count {
        let tag_bits = read_u8(input)?;
        if tag_bits as usize >= TypeTag::COUNT {
            return Err(invalid("bad class type tag"));
        }
        // SAFETY: bounds-checked.
        let type_tag = unsafe { TypeTag::from_bits_unchecked(tag_bits) };
        let fields = read_u32(input)? as usize;
        let superclass = match read_i32(input)? {
            -1 => None,
            index if index >= 0 => Some(index as usize),
            _ => return Err(invalid("bad superclass index")),
        };
        let method_count = read_u32(input)? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let selector = Selector::from_raw(read_u32(input)?);
            let function = read_u32(input)? as usize;
            methods.push((selector, function));
        }
        builder.classes.push(ClassDesc { type_tag, fields, superclass, methods });
    }

    let function_count = read_u32(input)? as usize;
    for _ in 0..function_count {
        let arity = read_u32(input)? as usize;
        let literal_count = read_u32(input)? as usize;
        let mut literals = Vec::with_capacity(literal_count);
        for _ in 0..literal_count {
            literals.push(read_literal(input)?);
        }
        let range_count = read_u32(input)? as usize;
        let mut catch_ranges = Vec::with_capacity(range_count);
        for _ in 0..range_count {
            catch_ranges.push(CatchRange {
                start: read_u32(input)?,
                end: read_u32(input)?,
                handler: read_u32(input)?,
                frame_offset: read_u32(input)?,
            });
        }
        let code = read_byte_list(input)?;
        builder.functions.push(FunctionDesc { arity, literals, catch_ranges, code });
    }

    let static_method_count = read_u32(input)? as usize;
    for _ in 0..static_method_count {
        builder.static_methods.push(read_u32(input)? as usize);
    }

    let constant_count = read_u32(input)? as usize;
    for _ in 0..constant_count {
        builder.constants.push(read_literal(input)?);
    }

    let static_count = read_u32(input)? as usize;
    for _ in 0..static_count {
        builder.statics.push(match read_u8(input)? {
            0 => StaticDesc::Value(read_literal(input)?),
            1 => StaticDesc::Initializer(read_u32(input)? as usize),
            _ => return Err(invalid("bad static tag")),
        });
    }

    let mut roles = [0usize; 17];
    for slot in roles.iter_mut() {
        *slot = read_u32(input)? as usize;
    }
    builder.roles = SpecialRoles {
        meta: roles[0],
        null: roles[1],
        boolean: roles[2],
        smi: roles[3],
        large_integer: roles[4],
        double: roles[5],
        string: roles[6],
        array: roles[7],
        byte_array: roles[8],
        boxed: roles[9],
        stack: roles[10],
        coroutine: roles[11],
        function: roles[12],
        initializer: roles[13],
        port: roles[14],
        sentinel: roles[15],
        error: roles[16],
    };
    builder.trampoline = read_u32(input)? as usize;
    builder.entry = read_u32(input)? as usize;
    builder.main_arity = read_u32(input)? as usize;

    Ok(builder)
}

// ── Materialization ────────────────────────────────────────────────

/// Load a snapshot and materialize the [`Program`]: classes first, then
/// the special objects, functions, constants and statics, finishing
/// with the folding pass.
pub fn load(bytes: &[u8], settings: HeapSettings) -> Result<Arc<Program>, SnapshotError> {
    let builder = parse(bytes)?;
    materialize(&builder, settings)
}

pub fn materialize(
    builder: &ProgramBuilder,
    settings: HeapSettings,
) -> Result<Arc<Program>, SnapshotError> {
    let _span = tracing::info_span!("snapshot_load").entered();
    let program = Arc::new(Program::new(settings));

    for name in &builder.names {
        program.names.intern(name);
    }

    // Pass 1: create class shells. The class word, superclass and
    // methods are patched once everything they reference exists.
    let placeholder = Value::from_smi(0);
    let mut classes = Vec::with_capacity(builder.classes.len());
    for (id, desc) in builder.classes.iter().enumerate() {
        let format = format_for(desc)?;
        let class = program.create_class(
            placeholder,
            format,
            placeholder,
            placeholder,
            id as i64,
        );
        classes.push(class);
    }
    let class_at = |index: usize| -> Result<Value, SnapshotError> {
        classes.get(index).copied().ok_or(invalid("class index"))
    };

    let roles = &builder.roles;
    let meta = class_at(roles.meta)?;
    for &class in &classes {
        // SAFETY: load window; classes are live.
        unsafe {
            (*class.as_mut_ptr::<Class>())
                .header
                .set_class_value(meta)
        };
    }

    // Special instances.
    let null_object = program.create_instance(
        class_at(roles.null)?,
        InstanceFlags::IMMUTABLE,
        placeholder,
    );
    let true_object = program.create_instance(
        class_at(roles.boolean)?,
        InstanceFlags::IMMUTABLE,
        null_object,
    );
    let false_object = program.create_instance(
        class_at(roles.boolean)?,
        InstanceFlags::IMMUTABLE,
        null_object,
    );
    let sentinel_object = program.create_instance(
        class_at(roles.sentinel)?,
        InstanceFlags::IMMUTABLE,
        null_object,
    );
    let error_class = class_at(roles.error)?;
    let stack_overflow_error = program.create_instance(
        error_class,
        InstanceFlags::IMMUTABLE,
        null_object,
    );
    let wrong_argument_type_error = program.create_instance(
        error_class,
        InstanceFlags::IMMUTABLE,
        null_object,
    );
    let index_out_of_bounds_error = program.create_instance(
        error_class,
        InstanceFlags::IMMUTABLE,
        null_object,
    );

    program.install_specials(Specials {
        null_object,
        true_object,
        false_object,
        sentinel_object,
        stack_overflow_error,
        wrong_argument_type_error,
        index_out_of_bounds_error,
        meta_class: meta,
        null_class: class_at(roles.null)?,
        bool_class: class_at(roles.boolean)?,
        smi_class: class_at(roles.smi)?,
        large_integer_class: class_at(roles.large_integer)?,
        double_class: class_at(roles.double)?,
        string_class: class_at(roles.string)?,
        array_class: class_at(roles.array)?,
        byte_array_class: class_at(roles.byte_array)?,
        boxed_class: class_at(roles.boxed)?,
        stack_class: class_at(roles.stack)?,
        coroutine_class: class_at(roles.coroutine)?,
        function_class: class_at(roles.function)?,
        initializer_class: class_at(roles.initializer)?,
        port_class: class_at(roles.port)?,
        no_such_method_trampoline: placeholder,
    });

    // Functions, with literal placeholders patched after creation (a
    // literal may reference a later function).
    let mut functions = Vec::with_capacity(builder.functions.len());
    for desc in &builder.functions {
        let placeholders = vec![placeholder; desc.literals.len()];
        let function = program.create_function(
            desc.arity,
            &placeholders,
            &desc.catch_ranges,
            &desc.code,
        );
        functions.push(function);
    }
    let function_at = |index: usize| -> Result<Value, SnapshotError> {
        functions.get(index).copied().ok_or(invalid("function index"))
    };

    for (index, desc) in builder.functions.iter().enumerate() {
        for (slot, literal) in desc.literals.iter().enumerate() {
            let value =
                materialize_literal(&program, &classes, &functions, literal)?;
            // SAFETY: load window; functions are live.
            unsafe {
                (*functions[index].as_mut_ptr::<Function>()).literals_mut()
                    [slot] = value;
            }
        }
    }

    // Method tables and superclasses.
    for (index, desc) in builder.classes.iter().enumerate() {
        let methods = program.create_array(
            desc.methods.len() * 2,
            program.specials().null_object,
        );
        // SAFETY: fresh program array.
        let methods_array = unsafe { methods.as_mut_ptr::<Array>() };
        for (slot, &(selector, function)) in desc.methods.iter().enumerate() {
            unsafe {
                (*methods_array).set_unchecked(
                    slot * 2,
                    Value::from_smi(selector.raw() as i64),
                );
                (*methods_array)
                    .set_unchecked(slot * 2 + 1, function_at(function)?);
            }
        }
        let superclass = match desc.superclass {
            Some(super_index) => class_at(super_index)?,
            None => program.specials().null_object,
        };
        // SAFETY: load window; classes are live.
        unsafe {
            let class = &mut *classes[index].as_mut_ptr::<Class>();
            class.set_methods(methods);
            class.set_superclass(superclass);
        }
    }

    // Tables.
    let classes_table =
        program.create_array(classes.len(), program.specials().null_object);
    // SAFETY: fresh program array.
    unsafe {
        let table = classes_table.as_mut_ptr::<Array>();
        for (index, &class) in classes.iter().enumerate() {
            (*table).set_unchecked(index, class);
        }
    }

    let static_methods_table = program.create_array(
        builder.static_methods.len(),
        program.specials().null_object,
    );
    // SAFETY: fresh program array.
    unsafe {
        let table = static_methods_table.as_mut_ptr::<Array>();
        for (index, &function) in builder.static_methods.iter().enumerate() {
            (*table).set_unchecked(index, function_at(function)?);
        }
    }

    let constants_table = program.create_array(
        builder.constants.len(),
        program.specials().null_object,
    );
    // SAFETY: fresh program array.
    unsafe {
        let table = constants_table.as_mut_ptr::<Array>();
        for (index, literal) in builder.constants.iter().enumerate() {
            let value =
                materialize_literal(&program, &classes, &functions, literal)?;
            (*table).set_unchecked(index, value);
        }
    }

    let statics_template = program
        .create_array(builder.statics.len(), program.specials().null_object);
    // SAFETY: fresh program array.
    unsafe {
        let table = statics_template.as_mut_ptr::<Array>();
        for (index, desc) in builder.statics.iter().enumerate() {
            let value = match desc {
                StaticDesc::Value(literal) => materialize_literal(
                    &program, &classes, &functions, literal,
                )?,
                StaticDesc::Initializer(function) => {
                    program.create_initializer(function_at(*function)?)
                }
            };
            (*table).set_unchecked(index, value);
        }
    }

    let trampoline = function_at(builder.trampoline)?;
    // SAFETY: load window.
    unsafe {
        program.patch_specials(|specials| {
            specials.no_such_method_trampoline = trampoline;
        });
    }

    program.install_tables(
        classes_table,
        constants_table,
        static_methods_table,
        statics_template,
        function_at(builder.entry)?,
        builder.main_arity,
    );
    program.fold();
    Ok(program)
}

fn format_for(desc: &ClassDesc) -> Result<InstanceFormat, SnapshotError> {
    Ok(match desc.type_tag {
        TypeTag::Instance => InstanceFormat::instance(desc.fields),
        TypeTag::Class => InstanceFormat::class(),
        TypeTag::Array => InstanceFormat::array(),
        TypeTag::ByteArray => InstanceFormat::byte_array(),
        TypeTag::Str => InstanceFormat::string(),
        TypeTag::Double => InstanceFormat::double(),
        TypeTag::LargeInteger => InstanceFormat::large_integer(),
        TypeTag::Boxed => InstanceFormat::boxed(),
        TypeTag::Stack => InstanceFormat::stack(),
        TypeTag::Coroutine => InstanceFormat::coroutine(),
        TypeTag::Function => InstanceFormat::function(),
        TypeTag::Initializer => InstanceFormat::initializer(),
    })
}

/// Materialize a single literal against an already-loaded program (the
/// session's change payloads).
pub fn materialize_detached_literal(
    program: &Arc<Program>,
    literal: &Literal,
) -> Result<Value, SnapshotError> {
    let classes: Vec<Value> =
        (0..program.class_count()).map(|i| program.class_at(i)).collect();
    let functions = program.functions().to_vec();
    materialize_literal(program, &classes, &functions, literal)
}

fn materialize_literal(
    program: &Arc<Program>,
    classes: &[Value],
    functions: &[Value],
    literal: &Literal,
) -> Result<Value, SnapshotError> {
    Ok(match literal {
        Literal::Smi(value) => {
            if !Value::fits_smi(*value) {
                return Err(invalid("smi literal out of range"));
            }
            Value::from_smi(*value)
        }
        Literal::LargeInteger(value) => program.create_large_integer(*value),
        Literal::Double(value) => program.create_double(*value),
        Literal::Str(value) => {
            let units: Vec<u16> = value.encode_utf16().collect();
            program.create_string(&units)
        }
        Literal::Null => program.specials().null_object,
        Literal::True => program.specials().true_object,
        Literal::False => program.specials().false_object,
        Literal::Sentinel => program.specials().sentinel_object,
        Literal::Class(index) => *classes
            .get(*index)
            .ok_or(invalid("class literal index"))?,
        Literal::Function(index) => *functions
            .get(*index)
            .ok_or(invalid("function literal index"))?,
        Literal::Array(elements) => {
            let array = program
                .create_array(elements.len(), program.specials().null_object);
            for (index, element) in elements.iter().enumerate() {
                let value =
                    materialize_literal(program, classes, functions, element)?;
                // SAFETY: fresh program array.
                unsafe {
                    (*array.as_mut_ptr::<Array>()).set_unchecked(index, value)
                };
            }
            array
        }
        Literal::ByteArray(bytes) => program.create_byte_array(bytes),
        Literal::Instance { class, immutable, fields } => {
            let class = *classes
                .get(*class)
                .ok_or(invalid("instance literal class"))?;
            let flags = if *immutable {
                InstanceFlags::IMMUTABLE
            } else {
                InstanceFlags::empty()
            };
            let instance = program.create_instance(
                class,
                flags,
                program.specials().null_object,
            );
            // SAFETY: live class.
            let expected =
                unsafe { class.as_ref::<Class>() }.format().instance_fields();
            if fields.len() != expected {
                return Err(invalid("instance literal field count"));
            }
            for (index, field) in fields.iter().enumerate() {
                let value =
                    materialize_literal(program, classes, functions, field)?;
                // SAFETY: fresh instance.
                unsafe {
                    (*instance.as_mut_ptr::<object::Instance>())
                        .set_field(index, value)
                };
            }
            instance
        }
    })
}

// ── Writing a loaded program back out ──────────────────────────────

/// Serialize a loaded program. Structural identity is preserved:
/// loading the result produces an equal snapshot.
pub fn write_program(program: &Program) -> Vec<u8> {
    let builder = builder_from_program(program);
    builder.write()
}

fn builder_from_program(program: &Program) -> ProgramBuilder {
    let mut builder = ProgramBuilder::empty();
    builder.names = program.names.all();

    let class_index = |value: Value| -> usize {
        // SAFETY: classes carry their dense id.
        unsafe { value.as_ref::<Class>() }.id() as usize
    };
    let functions = program.functions();
    let function_index = |value: Value| -> usize {
        functions
            .iter()
            .position(|&f| f == value)
            .expect("function in table")
    };

    for index in 0..program.class_count() {
        let class = program.class_at(index);
        // SAFETY: live class.
        let class_ref = unsafe { class.as_ref::<Class>() };
        let format = class_ref.format();
        let fields = match format.type_tag() {
            TypeTag::Instance => format.instance_fields(),
            _ => 0,
        };
        let superclass = class_ref.superclass();
        let superclass = superclass.is_ref().then(|| {
            let candidate = superclass;
            (candidate != program.specials().null_object)
                .then(|| class_index(candidate))
        });
        let mut methods = Vec::new();
        let methods_value = class_ref.methods();
        if methods_value.is_ref() {
            // SAFETY: method tables are arrays of pairs.
            let array = unsafe { methods_value.as_ref::<Array>() };
            let mut i = 0;
            while i + 1 < array.len() {
                // SAFETY: in bounds.
                let selector = unsafe { array.get_unchecked(i).to_smi() };
                let function = unsafe { array.get_unchecked(i + 1) };
                methods.push((
                    Selector::from_raw(selector as u32),
                    function_index(function),
                ));
                i += 2;
            }
        }
        builder.classes.push(ClassDesc {
            type_tag: format.type_tag(),
            fields,
            superclass: superclass.flatten(),
            methods,
        });
    }

    for &function in functions {
        // SAFETY: live function.
        let f = unsafe { function.as_ref::<Function>() };
        let literals = unsafe { f.literals() }
            .iter()
            .map(|&value| literal_from_value(program, value))
            .collect();
        builder.functions.push(FunctionDesc {
            arity: f.arity(),
            literals,
            catch_ranges: unsafe { f.catch_ranges() }.to_vec(),
            code: program.unfolded_bytecode(function),
        });
    }

    // SAFETY: live program arrays.
    unsafe {
        let table = program.static_methods().as_ref::<Array>();
        for i in 0..table.len() {
            builder
                .static_methods
                .push(function_index(table.get_unchecked(i)));
        }
        let constants = program.constants().as_ref::<Array>();
        for i in 0..constants.len() {
            builder
                .constants
                .push(literal_from_value(program, constants.get_unchecked(i)));
        }
        let statics = program.statics_template().as_ref::<Array>();
        for i in 0..statics.len() {
            let value = statics.get_unchecked(i);
            let desc = if value.is_ref()
                && value.as_ref::<HeapHeader>().class_value()
                    == program.specials().initializer_class
            {
                StaticDesc::Initializer(function_index(
                    value.as_ref::<Initializer>().function,
                ))
            } else {
                StaticDesc::Value(literal_from_value(program, value))
            };
            builder.statics.push(desc);
        }
    }

    let specials = program.specials();
    builder.roles = SpecialRoles {
        meta: class_index(specials.meta_class),
        null: class_index(specials.null_class),
        boolean: class_index(specials.bool_class),
        smi: class_index(specials.smi_class),
        large_integer: class_index(specials.large_integer_class),
        double: class_index(specials.double_class),
        string: class_index(specials.string_class),
        array: class_index(specials.array_class),
        byte_array: class_index(specials.byte_array_class),
        boxed: class_index(specials.boxed_class),
        stack: class_index(specials.stack_class),
        coroutine: class_index(specials.coroutine_class),
        function: class_index(specials.function_class),
        initializer: class_index(specials.initializer_class),
        port: class_index(specials.port_class),
        sentinel: class_index(
            // SAFETY: live instance.
            unsafe {
                specials
                    .sentinel_object
                    .as_ref::<HeapHeader>()
                    .class_value()
            },
        ),
        error: class_index(
            // SAFETY: live instance.
            unsafe {
                specials
                    .stack_overflow_error
                    .as_ref::<HeapHeader>()
                    .class_value()
            },
        ),
    };
    builder.trampoline = function_index(specials.no_such_method_trampoline);
    builder.entry = function_index(program.entry());
    builder.main_arity = program.main_arity();
    builder
}

fn literal_from_value(program: &Program, value: Value) -> Literal {
    if value.is_smi() {
        // SAFETY: checked.
        return Literal::Smi(unsafe { value.to_smi() });
    }
    let specials = program.specials();
    if value == specials.null_object {
        return Literal::Null;
    }
    if value == specials.true_object {
        return Literal::True;
    }
    if value == specials.false_object {
        return Literal::False;
    }
    if value == specials.sentinel_object {
        return Literal::Sentinel;
    }
    // SAFETY: live object.
    unsafe {
        let class = value.as_ref::<HeapHeader>().class_value();
        if class == specials.large_integer_class {
            Literal::LargeInteger(value.as_ref::<LargeInteger>().value())
        } else if class == specials.double_class {
            Literal::Double(value.as_ref::<Double>().value())
        } else if class == specials.string_class {
            Literal::Str(value.as_ref::<VmString>().to_rust_string())
        } else if class == specials.meta_class {
            Literal::Class(value.as_ref::<Class>().id() as usize)
        } else if class == specials.function_class {
            let index = program
                .functions()
                .iter()
                .position(|&f| f == value)
                .expect("function literal in table");
            Literal::Function(index)
        } else if class == specials.array_class {
            let array = value.as_ref::<Array>();
            Literal::Array(
                array
                    .slots()
                    .iter()
                    .map(|&slot| literal_from_value(program, slot))
                    .collect(),
            )
        } else if class == specials.byte_array_class {
            Literal::ByteArray(value.as_ref::<object::ByteArray>().bytes().to_vec())
        } else {
            let instance = value.as_ref::<object::Instance>();
            Literal::Instance {
                class: class.as_ref::<Class>().id() as usize,
                immutable: instance.is_immutable(),
                fields: instance
                    .fields()
                    .iter()
                    .map(|&field| literal_from_value(program, field))
                    .collect(),
            }
        }
    }
}

// ── Wire primitives (little-endian) ────────────────────────────────

pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

pub fn read_u8(input: &mut impl Read) -> Result<u8, SnapshotError> {
    let mut buffer = [0u8; 1];
    input.read_exact(&mut buffer)?;
    Ok(buffer[0])
}

pub fn read_u32(input: &mut impl Read) -> Result<u32, SnapshotError> {
    let mut buffer = [0u8; 4];
    input.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

pub fn read_i32(input: &mut impl Read) -> Result<i32, SnapshotError> {
    let mut buffer = [0u8; 4];
    input.read_exact(&mut buffer)?;
    Ok(i32::from_le_bytes(buffer))
}

pub fn read_i64(input: &mut impl Read) -> Result<i64, SnapshotError> {
    let mut buffer = [0u8; 8];
    input.read_exact(&mut buffer)?;
    Ok(i64::from_le_bytes(buffer))
}

pub fn read_byte_list(input: &mut impl Read) -> Result<Vec<u8>, SnapshotError> {
    let length = read_u32(input)? as usize;
    let mut bytes = vec![0u8; length];
    input.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Write a snapshot to a file.
pub fn write_to_file(program: &Program, path: &std::path::Path) -> Result<(), SnapshotError> {
    let bytes = write_program(program);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}
