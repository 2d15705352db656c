//! Integration tests for the media repository core live under `tests/`.
