//! Integration tests for SPDY frame parsing and building

mod headers;
mod parsing;
