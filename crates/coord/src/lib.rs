pub mod memory;
pub mod redis;
pub mod safe_op;
pub mod store;

pub use memory::MemoryCoord;
pub use redis::RedisCoord;
pub use safe_op::safe_run;
pub use store::CoordStore;
