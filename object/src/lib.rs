mod format;
mod layouts;
mod selector;
mod value;
mod visitor;

pub use format::{InstanceFormat, TypeTag};
pub use layouts::{
    align_size, value_is_immutable, Array, Boxed, ByteArray, CatchRange, Class,
    Coroutine, Double, Function, HeapHeader, Initializer, Instance,
    InstanceFlags, LargeInteger, Stack, VmString, WORD,
};
pub use selector::{Selector, SelectorKind};
pub use value::{FailureKind, Value};
pub use visitor::{object_size, visit_pointers};
