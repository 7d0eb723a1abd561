//! Integration test crate for vidpipe.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives the scheduler end to end over the test-pattern source.

#[cfg(test)]
mod playback;

#[cfg(test)]
mod lifecycle;

#[cfg(test)]
mod realtime;
