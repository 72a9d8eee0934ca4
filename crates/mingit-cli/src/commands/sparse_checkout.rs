use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use mingit_index::SparseCheckout;

use crate::Cli;

#[derive(Args)]
pub struct SparseCheckoutArgs {
    #[command(subcommand)]
    command: SparseCheckoutCommand,
}

#[derive(Subcommand)]
pub enum SparseCheckoutCommand {
    /// Enable sparse checkout with an empty cone
    Init {
        /// Use cone mode (default)
        #[arg(long)]
        cone: bool,

        /// Use non-cone mode (full pattern matching)
        #[arg(long)]
        no_cone: bool,
    },
    /// Replace the sparse-checkout directories
    Set {
        /// Directories to include
        patterns: Vec<String>,

        /// Read directories from stdin, one per line
        #[arg(long)]
        stdin: bool,
    },
    /// Print the current patterns
    List,
    /// Disable sparse checkout
    Disable,
}

pub fn run(args: &SparseCheckoutArgs, cli: &Cli) -> Result<i32> {
    match &args.command {
        SparseCheckoutCommand::Init { no_cone, .. } => run_init(cli, *no_cone),
        SparseCheckoutCommand::Set { patterns, stdin } => run_set(cli, patterns, *stdin),
        SparseCheckoutCommand::List => run_list(cli),
        SparseCheckoutCommand::Disable => run_disable(cli),
    }
}

fn pattern_file(cli: &Cli) -> PathBuf {
    cli.repo_dir.join("info").join("sparse-checkout")
}

fn config_file(cli: &Cli) -> PathBuf {
    cli.repo_dir.join("config")
}

fn run_init(cli: &Cli, no_cone: bool) -> Result<i32> {
    set_config(cli, "sparseCheckout", true)?;
    set_config(cli, "sparseCheckoutCone", !no_cone)?;

    let path = pattern_file(cli);
    if !path.exists() {
        SparseCheckout::cone::<_, &[u8]>([])
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(0)
}

fn run_set(cli: &Cli, patterns: &[String], stdin: bool) -> Result<i32> {
    set_config(cli, "sparseCheckout", true)?;
    set_config(cli, "sparseCheckoutCone", true)?;

    let mut dirs: Vec<String> = patterns.to_vec();
    if stdin {
        // One directory per line; blank lines are skipped by the parser.
        for line in io::stdin().lock().lines() {
            dirs.push(line?);
        }
    }
    if dirs.is_empty() {
        bail!("no directories specified");
    }

    let sc = SparseCheckout::cone(dirs.iter().map(String::as_bytes));
    let path = pattern_file(cli);
    sc.save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(0)
}

fn run_list(cli: &Cli) -> Result<i32> {
    let path = pattern_file(cli);
    if !path.exists() {
        eprintln!("warning: this worktree is not sparse (sparse-checkout file may not exist)");
        return Ok(0);
    }
    let sc = SparseCheckout::from_file(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut stdout = io::stdout().lock();
    if sc.use_cone_patterns() {
        for dir in sc.cone_dirs() {
            stdout.write_all(dir)?;
            stdout.write_all(b"\n")?;
        }
    } else {
        stdout.write_all(&sc.to_content())?;
    }
    Ok(0)
}

fn run_disable(cli: &Cli) -> Result<i32> {
    set_config(cli, "sparseCheckout", false)?;
    Ok(0)
}

/// Minimal line-oriented `key=value` configuration store.
fn set_config(cli: &Cli, key: &str, value: bool) -> Result<()> {
    let path = config_file(cli);
    let mut lines: Vec<String> = match std::fs::read_to_string(&path) {
        Ok(content) => content
            .lines()
            .filter(|l| l.split('=').next() != Some(key))
            .map(str::to_string)
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    lines.push(format!("{key}={value}"));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, lines.join("\n") + "\n")
        .with_context(|| format!("writing {}", path.display()))
}
