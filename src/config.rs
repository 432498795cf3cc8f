//! Command-line configuration.
//!
//! `repo2obj` takes the ticket file the repository compiler left behind and
//! produces a conventional relocatable object from the fragments it names.

use clap::Parser;
use std::path::PathBuf;

/// Convert a program-repository ticket to an ELF relocatable object.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Config {
    /// Ticket file produced by the repository compiler.
    pub ticket: PathBuf,

    /// Program repository path.
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Output filename.
    #[arg(short, default_value = "./a.out")]
    pub output: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

impl Config {
    /// The repository to open. The `REPOFILE` environment variable is
    /// consulted only when `--repo` is absent; it predates the flag and is
    /// kept for compilers that still export it.
    pub fn repo_path(&self) -> PathBuf {
        if let Some(repo) = &self.repo {
            return repo.clone();
        }
        std::env::var_os("REPOFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./clang.db"))
    }
}
