//! UI utilities for terminal output.

mod banner;

pub use banner::{format_preview, print_banner};
