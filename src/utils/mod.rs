//! Utility modules.

pub mod debug;
pub mod path;
pub mod platform;
pub mod shell;

pub use debug::{init_logging, is_debug_enabled, DEBUG_ENV};
pub use path::{contains_glob_chars, expand_home, normalize_path_for_sandbox};
pub use platform::{current_platform, get_arch, Platform};
pub use shell::{join_args, quote, render_env_prefix, split_args};
