//! Host and guest path validation.

mod path;

pub use path::{sanitize_path, PathError};
