pub mod stream;
pub mod target_addr;
