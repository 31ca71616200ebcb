use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod dataset;
pub mod executor;
pub mod ops;
pub mod paths;
pub mod schema;
pub mod shuffle;
pub mod tasks;
pub mod workflow;
pub mod writer;
