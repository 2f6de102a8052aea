// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod builtin;
mod handler;
mod registry;
pub mod safety;

pub use handler::{err, is_error, require_str, ToolHandler, ERROR_PREFIX};
pub use registry::{done_spec, is_terminal, stuck_spec, ToolRegistry};

use std::sync::Arc;

use builtin::{
    fs::{
        copy_spec, delete_spec, disk_usage_spec, edit_file_spec, list_dir_spec, move_spec,
        read_file_spec, tree_spec, write_file_spec, FsHandler,
    },
    search::{search_files_spec, SearchHandler},
    shell::{run_command_spec, run_tests_spec, DestructiveGate, ShellHandler},
};

/// Registry with the full builtin toolset: shell, file management, search.
/// `gate` wires the destructive-command confirmation seam (None = run
/// without confirmation).
pub fn builtin_registry(gate: Option<Arc<dyn DestructiveGate>>) -> ToolRegistry {
    let mut reg = ToolRegistry::new();

    let shell = Arc::new(ShellHandler { default_timeout_secs: 60, gate });
    reg.register(run_command_spec(), shell.clone());
    reg.register(run_tests_spec(), shell);

    let fs = Arc::new(FsHandler);
    for spec in [
        read_file_spec(),
        write_file_spec(),
        edit_file_spec(),
        list_dir_spec(),
        move_spec(),
        copy_spec(),
        delete_spec(),
        tree_spec(),
        disk_usage_spec(),
    ] {
        reg.register(spec, fs.clone());
    }

    reg.register(search_files_spec(), Arc::new(SearchHandler));
    reg
}
