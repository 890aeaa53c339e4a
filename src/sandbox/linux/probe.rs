//! Post-hoc violation synthesis.
//!
//! Linux has no per-rule audit stream for bwrap denials; instead the child's
//! exit is combined with policy probes over the paths the command named.

use std::path::Path;

use crate::manager::filesystem::{FsReadPlan, FsWritePlan};
use crate::violation::{ViolationEvent, ViolationKind};

/// Exit code shells use for "permission denied" execution failures.
const EXIT_PERMISSION_DENIED: i32 = 126;

/// Synthesize violations for a finished execution.
///
/// Absolute paths mentioned by the command are evaluated against the
/// compiled policy; on a failing exit, denied paths become filesystem
/// events. A permission-shaped exit with no path evidence yields a single
/// syscall probe event.
pub fn synthesize_violations(
    command: &str,
    exit_code: i32,
    read_plan: &FsReadPlan,
    write_plan: &FsWritePlan,
) -> Vec<ViolationEvent> {
    if exit_code == 0 {
        return Vec::new();
    }

    let mut events = Vec::new();

    for path in absolute_path_tokens(command) {
        let path_ref = Path::new(&path);

        if !read_plan.is_readable(path_ref) {
            events.push(ViolationEvent::new(
                ViolationKind::FsRead,
                path.clone(),
                format!("probe: read of {path} denied by policy (exit {exit_code})"),
            ));
            continue;
        }

        // Explicit write denials are reportable even without intent data;
        // paths that are merely outside allow_write are not.
        let explicitly_write_denied = write_plan.deny.iter().any(|r| r.matches(path_ref))
            || write_plan.carveouts.iter().any(|r| r.matches(path_ref));
        if explicitly_write_denied {
            events.push(ViolationEvent::new(
                ViolationKind::FsWrite,
                path.clone(),
                format!("probe: write to {path} denied by policy (exit {exit_code})"),
            ));
        }
    }

    if events.is_empty() && exit_code == EXIT_PERMISSION_DENIED {
        events.push(ViolationEvent::new(
            ViolationKind::SyscallDenied,
            format!("exit:{exit_code}"),
            format!("probe: child exited {exit_code} with no attributable path"),
        ));
    }

    events
}

/// Absolute path tokens of a shell command, deduplicated in order.
fn absolute_path_tokens(command: &str) -> Vec<String> {
    let tokens = crate::utils::split_args(command)
        .unwrap_or_else(|_| command.split_whitespace().map(str::to_string).collect());

    let mut out: Vec<String> = Vec::new();
    for token in tokens {
        // Redirect targets arrive glued to their operator.
        let token = token.trim_start_matches(['>', '<']);
        if token.starts_with('/') && !out.iter().any(|t| t == token) {
            out.push(token.to_string());
        }
    }
    out
}
