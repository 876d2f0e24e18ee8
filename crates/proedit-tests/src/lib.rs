//! Integration test crate for the ProEdit playback pipeline.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives proedit-playback end to end over proedit-core types.

#[cfg(test)]
mod decode_cache;

#[cfg(test)]
mod session;
