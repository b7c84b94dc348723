mod barrier;
mod heap;
mod space;
mod store_buffer;
mod system;

pub use barrier::SenseBarrier;
pub use heap::{HeapSettings, ImmutableHeap, Part, ProcessHeap, RootVisitor};
pub use space::{Scavenger, Space};
pub use store_buffer::StoreBuffer;
pub use system::{map_memory, unmap_memory, OS_PAGE_SIZE};
