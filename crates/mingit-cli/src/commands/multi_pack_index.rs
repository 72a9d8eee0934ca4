use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use mingit_pack::index::PackIndex;
use mingit_pack::midx::{verify_midx, MidxWriter};

use crate::Cli;

#[derive(Args)]
pub struct MultiPackIndexArgs {
    /// Pack directory holding the `.idx` files and the multi-pack index
    #[arg(long, default_value = ".")]
    pack_dir: PathBuf,

    #[command(subcommand)]
    command: MultiPackIndexCommand,
}

#[derive(Subcommand)]
pub enum MultiPackIndexCommand {
    /// Aggregate every pack index in the pack directory into a new MIDX
    Write,
    /// Check a multi-pack index against its packs
    Verify {
        /// The file to verify; defaults to the only `midx-*.midx` present
        #[arg(long)]
        midx: Option<PathBuf>,
    },
}

pub fn run(args: &MultiPackIndexArgs, _cli: &Cli) -> Result<i32> {
    match &args.command {
        MultiPackIndexCommand::Write => run_write(args),
        MultiPackIndexCommand::Verify { midx } => run_verify(args, midx.as_deref()),
    }
}

fn run_write(args: &MultiPackIndexArgs) -> Result<i32> {
    let mut writer = MidxWriter::new(&args.pack_dir);
    let mut nr_packs = 0u32;

    let mut idx_paths: Vec<PathBuf> = std::fs::read_dir(&args.pack_dir)
        .with_context(|| format!("reading {}", args.pack_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "idx"))
        .collect();
    idx_paths.sort();

    for idx_path in &idx_paths {
        let idx = PackIndex::open(idx_path)
            .with_context(|| format!("opening {}", idx_path.display()))?;
        let stem = idx_path
            .file_stem()
            .and_then(|s| s.to_str())
            .context("pack index has no usable name")?;
        let mtime = std::fs::metadata(idx_path)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let pack_id = writer.add_pack(format!("{stem}.pack"));
        for i in 0..idx.num_objects() {
            writer.add_object(idx.oid_at_index(i), pack_id, idx.offset_at_index(i), mtime);
        }
        nr_packs += 1;
    }

    if nr_packs == 0 {
        bail!("no pack indexes found in {}", args.pack_dir.display());
    }

    let path = writer.write()?;
    println!("{}", path.display());
    Ok(0)
}

fn run_verify(args: &MultiPackIndexArgs, midx: Option<&std::path::Path>) -> Result<i32> {
    let midx_path = match midx {
        Some(path) => path.to_path_buf(),
        None => {
            let mut candidates: Vec<PathBuf> = std::fs::read_dir(&args.pack_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("midx-") && n.ends_with(".midx"))
                })
                .collect();
            match candidates.len() {
                0 => bail!("no multi-pack index in {}", args.pack_dir.display()),
                1 => candidates.remove(0),
                _ => bail!("multiple multi-pack indexes; pass --midx"),
            }
        }
    };

    let report = verify_midx(&midx_path, &args.pack_dir)
        .with_context(|| format!("verifying {}", midx_path.display()))?;
    println!("{report}");
    Ok(if report.is_ok() { 0 } else { 1 })
}
