mod address;
mod memory_access;
mod region;

pub use self::{
    address::{ProcessId, Va},
    memory_access::MemoryAccess,
    region::MemoryRegion,
};
