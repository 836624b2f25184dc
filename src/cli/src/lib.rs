//! Hostlink CLI - drives the host daemon of a headless VM.

pub mod commands;
pub mod output;
