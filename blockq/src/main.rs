use anyhow::{Context, Result, anyhow, bail};
use blockq_core::dag::node::DagNode;
use blockq_core::{
    AddEvent, AddInput, AddOptions, Algorithm, Backend, CancelToken, ChunkerSpec, Cid, CidPrefix,
    Codec, Layout, PinMode, Pinner, RemoveOptions, Repo, RepoConfig, parse_cid,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod output;

use output::{
    AddOutput, AddedEntry, BlockPutOutput, BlockRmOutput, BlockStatOutput, FilestoreListOutput,
    FilestoreRefInfo, FilestoreVerifyOutput, GcOutput, GetOutput, InitOutput, OutputWriter,
    PinChangeOutput, PinInfo, PinListOutput, VerifyInfo,
};

/// blockq - A content-addressed block repository
#[derive(Parser)]
#[command(name = "blockq")]
#[command(about = "Content-addressed block repository with pinning", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository root (defaults to BLOCKQ_ROOT env var or ./blockq-repo)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Hash algorithm for new CIDs
        #[arg(long, default_value = "blake3-256")]
        algo: String,

        /// Enable the no-copy filestore backend
        #[arg(long)]
        filestore: bool,

        /// Default chunker for adds
        #[arg(long, default_value = "size-262144")]
        chunker: String,
    },

    /// Add files, directories or stdin ("-") to the repository
    Add(AddArgs),

    /// Output file content to stdout
    Cat {
        /// Root CID of the file
        cid: String,
    },

    /// Export a file or directory to the filesystem
    Get {
        /// Root CID to export
        cid: String,

        /// Destination path (must not exist)
        dest: PathBuf,
    },

    /// Work with individual blocks
    #[command(subcommand)]
    Block(BlockCommands),

    /// Manage pins
    #[command(subcommand)]
    Pin(PinCommands),

    /// Garbage collect unpinned blocks
    Gc {
        /// Dry run - show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect filestore references
    #[command(subcommand)]
    Filestore(FilestoreCommands),
}

#[derive(Args)]
struct AddArgs {
    /// Paths to add; "-" reads stdin
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Chunking algorithm: size-<bytes>, rabin, rabin-<avg> or rabin-<min>-<avg>-<max>
    #[arg(short = 's', long, default_value = "")]
    chunker: String,

    /// Use the trickle layout instead of balanced
    #[arg(long)]
    trickle: bool,

    /// Store leaves as raw blocks
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    raw_leaves: Option<bool>,

    /// Reference file contents through the filestore instead of copying
    #[arg(long)]
    nocopy: bool,

    /// Check the filestore for pre-existing blocks
    #[arg(long)]
    fscache: bool,

    /// Wrap the inputs in a directory
    #[arg(short = 'w', long = "wrap-with-directory")]
    wrap: bool,

    /// Include hidden files
    #[arg(short = 'H', long)]
    hidden: bool,

    /// Pin the added content recursively
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pin: bool,

    /// Only compute CIDs, write nothing
    #[arg(short = 'n', long)]
    only_hash: bool,

    /// Print only CIDs
    #[arg(short, long)]
    quiet: bool,

    /// Print only the final root CID
    #[arg(short = 'Q', long)]
    quieter: bool,

    /// Print nothing
    #[arg(long)]
    silent: bool,

    /// Report bytes ingested on stderr
    #[arg(long)]
    progress: bool,

    /// Entry name for stdin content
    #[arg(long, default_value = "stdin")]
    stdin_name: String,
}

#[derive(Subcommand)]
enum BlockCommands {
    /// Show size and location of a block
    Stat {
        cid: String,
    },

    /// Output raw block bytes to stdout
    Get {
        cid: String,
    },

    /// Store a single block from a file or stdin
    Put {
        /// Input file (reads stdin if omitted)
        file: Option<PathBuf>,

        /// Block codec: raw or node
        #[arg(long, default_value = "raw")]
        format: String,

        /// Hash algorithm (defaults to the repository's)
        #[arg(long)]
        algo: Option<String>,
    },

    /// Remove blocks, refusing pinned ones
    Rm {
        #[arg(required = true)]
        cids: Vec<String>,

        /// Ignore blocks that are already absent
        #[arg(short, long)]
        force: bool,

        /// Report failures only
        #[arg(short, long)]
        quiet: bool,

        /// Backend to delete from: /blocks or /filestore
        #[arg(long, default_value = "/blocks")]
        backend: String,
    },
}

#[derive(Subcommand)]
enum PinCommands {
    /// Pin CIDs
    Add {
        #[arg(required = true)]
        cids: Vec<String>,

        /// Pin the whole DAG (false pins only the named block)
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        recursive: bool,
    },

    /// List pins
    Ls {
        /// direct, recursive, indirect or all
        #[arg(short = 't', long = "type", default_value = "all")]
        pin_type: String,
    },

    /// Remove pins
    Rm {
        #[arg(required = true)]
        cids: Vec<String>,

        /// Remove recursive pins
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        recursive: bool,
    },
}

#[derive(Subcommand)]
enum FilestoreCommands {
    /// List filestore references
    Ls,

    /// Re-read and re-hash every reference
    Verify,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let out = OutputWriter::new(cli.json);

    // Determine repo root: CLI arg > BLOCKQ_ROOT env var > ./blockq-repo default
    let root = cli
        .root
        .or_else(|| std::env::var("BLOCKQ_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./blockq-repo"));

    if let Err(e) = run(cli.command, &root, &out) {
        out.write_error(&e, 1);
        std::process::exit(1);
    }
}

/// Log filter: BLOCKQ_LOG, then RUST_LOG, then "warn".
fn init_tracing() {
    let filter = EnvFilter::try_from_env("BLOCKQ_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(command: Commands, root: &Path, out: &OutputWriter) -> Result<()> {
    match command {
        Commands::Init {
            algo,
            filestore,
            chunker,
        } => cmd_init(root, out, &algo, filestore, &chunker),
        Commands::Add(args) => cmd_add(root, out, args),
        Commands::Cat { cid } => cmd_cat(root, &cid),
        Commands::Get { cid, dest } => cmd_get(root, out, &cid, &dest),
        Commands::Block(block_cmd) => match block_cmd {
            BlockCommands::Stat { cid } => cmd_block_stat(root, out, &cid),
            BlockCommands::Get { cid } => cmd_block_get(root, &cid),
            BlockCommands::Put { file, format, algo } => {
                cmd_block_put(root, out, file.as_deref(), &format, algo.as_deref())
            }
            BlockCommands::Rm {
                cids,
                force,
                quiet,
                backend,
            } => cmd_block_rm(root, out, &cids, force, quiet, &backend),
        },
        Commands::Pin(pin_cmd) => match pin_cmd {
            PinCommands::Add { cids, recursive } => cmd_pin_add(root, out, &cids, recursive),
            PinCommands::Ls { pin_type } => cmd_pin_ls(root, out, &pin_type),
            PinCommands::Rm { cids, recursive } => cmd_pin_rm(root, out, &cids, recursive),
        },
        Commands::Gc { dry_run } => cmd_gc(root, out, dry_run),
        Commands::Filestore(fs_cmd) => match fs_cmd {
            FilestoreCommands::Ls => cmd_filestore_ls(root, out),
            FilestoreCommands::Verify => cmd_filestore_verify(root, out),
        },
    }
}

fn open_repo(root: &Path) -> Result<Repo> {
    tracing::debug!(root = %root.display(), "opening repository");
    Repo::open(root).with_context(|| format!("Failed to open repository at {}", root.display()))
}

fn parse_one(s: &str) -> Result<Cid> {
    parse_cid(s).with_context(|| format!("Invalid CID: {}", s))
}

fn parse_all(cids: &[String]) -> Result<Vec<Cid>> {
    cids.iter().map(|s| parse_one(s)).collect()
}

fn stdin_reader() -> Result<io::Stdin> {
    if atty::is(atty::Stream::Stdin) {
        bail!("Refusing to read content from a terminal; pipe data in or pass a path");
    }
    Ok(io::stdin())
}

fn cmd_init(root: &Path, out: &OutputWriter, algo: &str, filestore: bool, chunker: &str) -> Result<()> {
    let config = RepoConfig {
        algorithm: Algorithm::parse(algo)?,
        filestore,
        chunker: ChunkerSpec::parse(chunker)?,
    };

    Repo::init(root, config)
        .with_context(|| format!("Failed to initialize repository at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        algorithm: config.algorithm.as_str().to_string(),
        filestore,
        chunker: config.chunker.to_string(),
    };
    out.write(&data, || {
        format!(
            "Initialized blockq repository at {}\nAlgorithm: {}\nFilestore: {}\n",
            root.display(),
            config.algorithm.as_str(),
            if filestore { "enabled" } else { "disabled" }
        )
    })
}

fn cmd_add(root: &Path, out: &OutputWriter, args: AddArgs) -> Result<()> {
    let repo = open_repo(root)?;

    let mut inputs = Vec::with_capacity(args.paths.len());
    for path in &args.paths {
        if path.as_os_str() == "-" {
            inputs.push(AddInput::reader(args.stdin_name.clone(), stdin_reader()?));
        } else {
            inputs.push(AddInput::path(path));
        }
    }

    let options = AddOptions {
        chunker: args.chunker,
        layout: if args.trickle {
            Layout::Trickle
        } else {
            Layout::Balanced
        },
        raw_leaves: args.raw_leaves,
        no_copy: args.nocopy,
        fs_cache: args.fscache,
        wrap: args.wrap,
        hidden: args.hidden,
        pin: args.pin,
        only_hash: args.only_hash,
        silent: args.silent,
        progress: args.progress,
    };
    let adder = repo.adder(options).context("Invalid add options")?;

    let (events, worker) = adder.spawn(inputs, CancelToken::new());
    let mut entries = Vec::new();
    for event in events {
        match event {
            AddEvent::Progress { name, bytes } => {
                eprintln!("{}: {} bytes", name, bytes);
            }
            AddEvent::Completed { name, cid, size } => {
                if !args.quieter {
                    if args.quiet {
                        out.line(cid.to_string())?;
                    } else {
                        out.line(format!("added {} {}", cid, name).trim_end())?;
                    }
                }
                entries.push(AddedEntry {
                    name,
                    cid: cid.to_string(),
                    size,
                });
            }
        }
    }

    let summary = worker
        .join()
        .map_err(|_| anyhow!("add worker panicked"))?
        .context("Failed to add content")?;

    if args.quieter
        && !args.silent
        && let Some(root_cid) = summary.root
    {
        out.line(root_cid.to_string())?;
    }

    if out.is_json() {
        if args.silent {
            // Silent adds stream nothing; the summary still has every entry.
            entries = summary
                .completed
                .iter()
                .filter_map(|event| match event {
                    AddEvent::Completed { name, cid, size } => Some(AddedEntry {
                        name: name.clone(),
                        cid: cid.to_string(),
                        size: *size,
                    }),
                    AddEvent::Progress { .. } => None,
                })
                .collect();
        }
        let data = AddOutput {
            success: true,
            result_code: 0,
            entries,
            root: summary.root.map(|cid| cid.to_string()),
            bytes: summary.bytes,
        };
        out.write(&data, String::new)?;
    }

    Ok(())
}

fn cmd_cat(root: &Path, cid_str: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_one(cid_str)?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();

    repo.cat(&cid, &mut handle)
        .with_context(|| format!("Failed to output {}", cid))?;

    Ok(())
}

fn cmd_get(root: &Path, out: &OutputWriter, cid_str: &str, dest: &Path) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_one(cid_str)?;

    repo.export(&cid, dest)
        .with_context(|| format!("Failed to export {} to {}", cid, dest.display()))?;

    let data = GetOutput {
        success: true,
        result_code: 0,
        cid: cid.to_string(),
        destination: dest.display().to_string(),
    };
    out.write(&data, || format!("Saved {} to {}\n", cid, dest.display()))
}

fn cmd_block_stat(root: &Path, out: &OutputWriter, cid_str: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_one(cid_str)?;

    let stat = repo
        .stat_block(&cid)
        .with_context(|| format!("Failed to stat {}", cid))?;

    let data = BlockStatOutput {
        success: true,
        result_code: 0,
        cid: stat.cid.to_string(),
        size: stat.size,
        backend: stat.backend.to_string(),
    };
    out.write(&data, || {
        format!(
            "Key: {}\nSize: {}\nBackend: {}\n",
            stat.cid, stat.size, stat.backend
        )
    })
}

fn cmd_block_get(root: &Path, cid_str: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_one(cid_str)?;

    let block = repo
        .get_block(&cid)
        .with_context(|| format!("Failed to read block {}", cid))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(block.data())?;
    handle.flush()?;
    Ok(())
}

fn cmd_block_put(
    root: &Path,
    out: &OutputWriter,
    file: Option<&Path>,
    format: &str,
    algo: Option<&str>,
) -> Result<()> {
    let repo = open_repo(root)?;

    let codec = Codec::parse(format)?;
    let algorithm = match algo {
        Some(name) => Algorithm::parse(name)?,
        None => repo.config().algorithm,
    };

    let data = match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            stdin_reader()?.read_to_end(&mut buf)?;
            buf
        }
    };

    if codec == Codec::Node {
        DagNode::decode(&data).context("Block is not a valid node")?;
    }

    let cid = repo
        .put_block(data, Some(CidPrefix::new(codec, algorithm)))
        .context("Failed to store block")?;

    let output = BlockPutOutput {
        success: true,
        result_code: 0,
        cid: cid.to_string(),
    };
    out.write(&output, || format!("{}\n", cid))
}

fn cmd_block_rm(
    root: &Path,
    out: &OutputWriter,
    cid_strs: &[String],
    force: bool,
    quiet: bool,
    backend: &str,
) -> Result<()> {
    let repo = open_repo(root)?;
    let cids = parse_all(cid_strs)?;
    let options = RemoveOptions {
        force,
        quiet,
        backend: Backend::from_prefix(backend)?,
    };

    let outcomes = repo
        .rm_blocks(cids, options, CancelToken::new())
        .context("Failed to start removal")?;

    let mut failed = false;
    let mut collected = Vec::new();
    for outcome in outcomes {
        match &outcome.error {
            Some(msg) if outcome.is_abort() => out.line(format!("aborted: {}", msg))?,
            Some(msg) => out.line(format!("cannot remove {}: {}", outcome.hash, msg))?,
            None => out.line(format!("removed {}", outcome.hash))?,
        }
        failed |= outcome.is_error();
        collected.push(outcome);
    }

    if out.is_json() {
        let data = BlockRmOutput {
            success: !failed,
            result_code: u8::from(failed),
            outcomes: collected,
        };
        out.write(&data, String::new)?;
    }

    if failed {
        bail!("some blocks not removed");
    }
    Ok(())
}

fn cmd_pin_add(root: &Path, out: &OutputWriter, cid_strs: &[String], recursive: bool) -> Result<()> {
    let repo = open_repo(root)?;
    let mode = if recursive {
        PinMode::Recursive
    } else {
        PinMode::Direct
    };

    let mut pinned = Vec::new();
    for cid in parse_all(cid_strs)? {
        repo.pin(&cid, mode)
            .with_context(|| format!("Failed to pin {}", cid))?;
        pinned.push(cid.to_string());
    }

    let data = PinChangeOutput {
        success: true,
        result_code: 0,
        pins: pinned,
    };
    out.write(&data, || {
        data.pins
            .iter()
            .map(|cid| format!("pinned {} {}\n", cid, mode.as_str()))
            .collect()
    })
}

fn cmd_pin_ls(root: &Path, out: &OutputWriter, pin_type: &str) -> Result<()> {
    let repo = open_repo(root)?;

    let modes = match pin_type {
        "all" => vec![PinMode::Direct, PinMode::Recursive, PinMode::Indirect],
        other => vec![PinMode::parse(other)?],
    };

    let mut pins = Vec::new();
    for mode in modes {
        let cids = repo
            .pins()
            .list(mode)
            .with_context(|| format!("Failed to list {} pins", mode.as_str()))?;
        pins.extend(cids.into_iter().map(|cid| PinInfo {
            cid: cid.to_string(),
            mode: mode.as_str().to_string(),
        }));
    }

    let data = PinListOutput {
        success: true,
        result_code: 0,
        pins,
    };
    out.write(&data, || {
        data.pins
            .iter()
            .map(|pin| format!("{} {}\n", pin.cid, pin.mode))
            .collect()
    })
}

fn cmd_pin_rm(root: &Path, out: &OutputWriter, cid_strs: &[String], recursive: bool) -> Result<()> {
    let repo = open_repo(root)?;

    let mut unpinned = Vec::new();
    for cid in parse_all(cid_strs)? {
        repo.unpin(&cid, recursive)
            .with_context(|| format!("Failed to unpin {}", cid))?;
        unpinned.push(cid.to_string());
    }

    let data = PinChangeOutput {
        success: true,
        result_code: 0,
        pins: unpinned,
    };
    out.write(&data, || {
        data.pins
            .iter()
            .map(|cid| format!("unpinned {}\n", cid))
            .collect()
    })
}

fn cmd_gc(root: &Path, out: &OutputWriter, dry_run: bool) -> Result<()> {
    let repo = open_repo(root)?;

    let stats = repo
        .gc(dry_run)
        .context("Failed to run garbage collection")?;

    let data = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        blocks_deleted: stats.blocks_deleted,
        bytes_freed: stats.bytes_freed,
    };
    out.write(&data, || {
        if dry_run {
            format!(
                "Dry run - no blocks deleted\nWould delete {} blocks\nWould free {} bytes\n",
                stats.blocks_deleted, stats.bytes_freed
            )
        } else {
            format!(
                "Deleted {} blocks\nFreed {} bytes\n",
                stats.blocks_deleted, stats.bytes_freed
            )
        }
    })
}

fn cmd_filestore_ls(root: &Path, out: &OutputWriter) -> Result<()> {
    let repo = open_repo(root)?;
    let Some(manager) = repo.filestore() else {
        bail!("Filestore is not enabled for this repository");
    };

    let refs: Vec<FilestoreRefInfo> = manager
        .list()
        .context("Failed to list filestore references")?
        .into_iter()
        .map(|r| FilestoreRefInfo {
            cid: r.cid.to_string(),
            path: r.path.display().to_string(),
            offset: r.offset,
            size: r.size,
        })
        .collect();

    let data = FilestoreListOutput {
        success: true,
        result_code: 0,
        refs,
    };
    out.write(&data, || {
        data.refs
            .iter()
            .map(|r| format!("{} {} {} {}\n", r.cid, r.size, r.path, r.offset))
            .collect()
    })
}

fn cmd_filestore_verify(root: &Path, out: &OutputWriter) -> Result<()> {
    let repo = open_repo(root)?;
    let Some(manager) = repo.filestore() else {
        bail!("Filestore is not enabled for this repository");
    };

    let entries: Vec<VerifyInfo> = manager
        .verify_all()
        .context("Failed to verify filestore references")?
        .into_iter()
        .map(|(cid, outcome)| VerifyInfo {
            cid: cid.to_string(),
            ok: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
        })
        .collect();
    let failures = entries.iter().filter(|e| !e.ok).count();

    let data = FilestoreVerifyOutput {
        success: failures == 0,
        result_code: u8::from(failures > 0),
        entries,
    };
    out.write(&data, || {
        data.entries
            .iter()
            .map(|e| match &e.error {
                None => format!("ok {}\n", e.cid),
                Some(msg) => format!("error {}: {}\n", e.cid, msg),
            })
            .collect()
    })?;

    if failures > 0 {
        bail!("{} filestore references failed verification", failures);
    }
    Ok(())
}
