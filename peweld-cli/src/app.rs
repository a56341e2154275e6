use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// peweld - embed DLLs into executables and inspect PE images
#[derive(Debug, Parser)]
#[command(name = "peweld", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Switches of the `embed` subcommand.
#[derive(Debug, Parser)]
#[allow(clippy::struct_excessive_bools)]
pub struct EmbedFlags {
    /// Restore the original entry point in the mapped headers before the host runs.
    #[arg(long)]
    pub fix_entry_point: bool,

    /// Resolve host imports of the guest DLLs directly to the embedded code.
    #[arg(long)]
    pub inject_imports: bool,

    /// Do not merge guest exports into the host.
    #[arg(long)]
    pub no_exports: bool,

    /// Do not merge guest resources into the host.
    #[arg(long)]
    pub no_resources: bool,

    /// Do not merge guest delay-load imports into the host.
    #[arg(long)]
    pub no_delay_imports: bool,

    /// Do not give guests a private TLS block.
    #[arg(long)]
    pub no_tls_patch: bool,

    /// Do not merge guest runtime function tables (x64).
    #[arg(long)]
    pub no_exception_merge: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Embed one or more DLLs into an executable.
    Embed {
        /// Path to the host executable.
        #[arg(value_name = "HOST")]
        host: PathBuf,

        /// Paths to the DLLs to embed, in order; the last path is the output file.
        #[arg(value_name = "GUEST... OUTPUT", num_args = 2.., required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        flags: EmbedFlags,
    },

    /// Display image overview: machine, kind, base, entry point, sections and directories.
    Info {
        /// Path to the PE file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// List imported DLLs and functions, including delay-loaded ones.
    Imports {
        /// Path to the PE file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// List exported functions.
    Exports {
        /// Path to the PE file.
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}
