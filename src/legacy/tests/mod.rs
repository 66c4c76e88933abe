// src/legacy/tests/mod.rs
