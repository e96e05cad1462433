// Raw block device I/O
//
// - raw_writer.rs: bounded chunked copy of an assembled image onto the target

pub mod raw_writer;

#[cfg(test)]
mod raw_writer_tests;

pub use raw_writer::{RawDeviceWriter, RawWriteReport, CHUNK_SIZE};
