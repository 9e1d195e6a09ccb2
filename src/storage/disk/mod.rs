pub mod aio;
pub mod direct_io;
