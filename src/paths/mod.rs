//! Path, identifier and link-target canonicalization.
//!
//! Every component that compares locations goes through these functions, so that a vault
//! written on a case-insensitive filesystem (or with decomposed unicode file names) produces the
//! same keys everywhere.

pub mod path;

pub use path::{
    base_name, canonical_link_target, canonical_path, extension_of, is_extension,
    os_path_to_string, relative_path, resolve_in_root, strip_extension, string_to_os_path,
};
