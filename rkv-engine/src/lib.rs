// rkv-engine - In-memory row store backing rkv-server

pub mod engine;
pub mod filter;
pub mod memory;

pub use engine::RowEngine;
pub use memory::MemoryEngine;
