//! OpenGL 4.5 core bindings, generated by `gl_generator` at build time.

#![allow(
    non_upper_case_globals,
    non_snake_case,
    non_camel_case_types,
    unused,
    clippy::all
)]

include!(concat!(env!("OUT_DIR"), "/gl_bindings.rs"));
