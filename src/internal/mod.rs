// src/internal/mod.rs

//! Internal utilities that are not part of the public API.

pub(crate) mod cache_padded;
