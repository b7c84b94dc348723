use crate::format::TypeTag;
use crate::layouts::{
    Array, Boxed, ByteArray, Class, Coroutine, Function, HeapHeader,
    Initializer, Instance, Stack, VmString, WORD,
};
use crate::Value;

/// Trace all `Value` edges of a heap object for the collectors.
///
/// Polymorphism is a dispatch over the format type tag, not virtual
/// methods. The class word is visited first; classes live in program
/// space and never move, so the callback is free to ignore it by address
/// range. Stack slots at or below `top` may hold raw return addresses
/// into program-space bytecode; the collectors filter those the same way.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object whose class word holds a
/// live class pointer.
pub unsafe fn visit_pointers(obj: *mut u8, visitor: &mut dyn FnMut(&mut Value)) {
    let header = &mut *(obj as *mut HeapHeader);
    let tag = header.format().type_tag();

    // The class word itself is an edge.
    {
        let class_word = obj as *mut Value;
        visitor(&mut *class_word);
    }

    match tag {
        TypeTag::Instance => {
            let instance = &mut *(obj as *mut Instance);
            let count = instance.field_count();
            let fields = (obj as *mut Value).add(2);
            for i in 0..count {
                visitor(&mut *fields.add(i));
            }
        }
        TypeTag::Class => {
            let class = &mut *(obj as *mut Class);
            for field in class.field_refs() {
                visitor(field);
            }
        }
        TypeTag::Array => {
            let array = &mut *(obj as *mut Array);
            for slot in array.slots_mut() {
                visitor(slot);
            }
        }
        TypeTag::Function => {
            let function = &mut *(obj as *mut Function);
            for literal in function.literals_mut() {
                visitor(literal);
            }
        }
        TypeTag::Boxed => {
            let boxed = &mut *(obj as *mut Boxed);
            visitor(&mut boxed.value);
        }
        TypeTag::Stack => {
            let stack = &mut *(obj as *mut Stack);
            for slot in stack.live_slots_mut() {
                visitor(slot);
            }
        }
        TypeTag::Coroutine => {
            let coroutine = &mut *(obj as *mut Coroutine);
            visitor(&mut coroutine.stack);
            visitor(&mut coroutine.caller);
        }
        TypeTag::Initializer => {
            let initializer = &mut *(obj as *mut Initializer);
            visitor(&mut initializer.function);
        }
        TypeTag::ByteArray
        | TypeTag::Str
        | TypeTag::Double
        | TypeTag::LargeInteger => {
            // No reference fields beyond the class word.
        }
    }
}

/// Compute the total byte size of a heap object. Counterpart of
/// [`visit_pointers`], used by the scavenger to know how many bytes to
/// copy before it overwrites the class word with a forwarding word.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object whose class word still
/// holds a live class pointer.
pub unsafe fn object_size(obj: *const u8) -> usize {
    let header = &*(obj as *const HeapHeader);
    let format = header.format();
    match format.type_tag() {
        TypeTag::Array => {
            Array::allocation_size((*(obj as *const Array)).len())
        }
        TypeTag::ByteArray => {
            ByteArray::allocation_size((*(obj as *const ByteArray)).len())
        }
        TypeTag::Str => {
            VmString::allocation_size((*(obj as *const VmString)).len())
        }
        TypeTag::Stack => {
            Stack::allocation_size((*(obj as *const Stack)).len())
        }
        TypeTag::Function => (*(obj as *const Function)).byte_size(),
        // Every fixed-size layout records its word count in the format.
        _ => format.fixed_size_words() * WORD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::InstanceFormat;
    use crate::layouts::InstanceFlags;

    fn make_class(buf: &mut Vec<u64>, format: InstanceFormat) -> Value {
        let offset = buf.len();
        buf.resize(offset + Class::SIZE / WORD, 0);
        let ptr = buf[offset..].as_mut_ptr() as *mut Class;
        let value = Value::from_ptr(ptr);
        unsafe {
            (*ptr).init(value, format, Value::from_smi(0), Value::from_smi(0), 0)
        };
        value
    }

    #[test]
    fn instance_edges_are_class_word_plus_fields() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::instance(2));

        let size = Instance::allocation_size(2);
        let mut storage = vec![0u64; size / WORD];
        let obj = storage.as_mut_ptr() as *mut Instance;
        unsafe {
            (*obj).init(class, InstanceFlags::empty(), 2, Value::from_smi(5))
        };

        let mut seen = Vec::new();
        unsafe {
            visit_pointers(obj as *mut u8, &mut |v| seen.push(*v));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], class);
        assert_eq!(seen[1], Value::from_smi(5));
        assert_eq!(unsafe { object_size(obj as *const u8) }, size);
    }

    #[test]
    fn stack_scans_only_live_slots() {
        let mut buf = Vec::new();
        let class = make_class(&mut buf, InstanceFormat::stack());

        let size = Stack::allocation_size(16);
        let mut storage = vec![0u64; size / WORD];
        let obj = storage.as_mut_ptr() as *mut Stack;
        unsafe { (*obj).init(class, 16) };
        let stack = unsafe { &mut *obj };
        for i in 0..16 {
            unsafe { stack.set(i, Value::from_smi(i as i64)) };
        }
        stack.set_top(4);

        let mut seen = Vec::new();
        unsafe {
            visit_pointers(obj as *mut u8, &mut |v| seen.push(*v));
        }
        // class word + slots 0..=4
        assert_eq!(seen.len(), 1 + 5);
    }

    #[test]
    fn variable_layouts_report_aligned_sizes() {
        let mut buf = Vec::new();
        let ba_class = make_class(&mut buf, InstanceFormat::byte_array());
        let size = ByteArray::allocation_size(3);
        assert_eq!(size % 8, 0);
        let mut storage = vec![0u64; size / WORD];
        let obj = storage.as_mut_ptr() as *mut ByteArray;
        unsafe { (*obj).init(ba_class, &[1, 2, 3]) };
        assert_eq!(unsafe { object_size(obj as *const u8) }, size);
    }
}
