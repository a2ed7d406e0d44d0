//! # cask CLI
//!
//! Command-line interface for Cask single-file containers.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use cask_config::{init_logging, Config};
use cask_fs::{FileSystem, FsOptions, HEADER_SIZE};

mod import;

/// Cask - a hierarchical filesystem inside one host file
#[derive(Parser)]
#[command(name = "cask")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Container file (defaults to `container.path` from config)
    #[arg(short, long, global = true, value_name = "PATH")]
    container: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parent directories too
        #[arg(short, long)]
        parents: bool,
    },

    /// Remove an empty directory
    Rmdir { path: String },

    /// Create an empty file if it does not exist
    Touch { path: String },

    /// Remove a file
    Rm { path: String },

    /// Replace a file's content from FILE or stdin, creating it if needed
    Write {
        path: String,
        #[arg(value_name = "FILE")]
        source: Option<PathBuf>,
    },

    /// Append FILE or stdin to a file, creating it if needed
    Append {
        path: String,
        #[arg(value_name = "FILE")]
        source: Option<PathBuf>,
    },

    /// Print a file's content
    Cat { path: String },

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Show kind and size
        #[arg(short, long)]
        long: bool,
    },

    /// Move a file or directory into another directory
    Mv { source: String, destination: String },

    /// Rename a file or directory in place
    Rename { path: String, new_name: String },

    /// Print a file's size in bytes
    Size { path: String },

    /// Show container statistics, or details of one path
    Stat { path: Option<String> },

    /// Compact the container
    Defrag,

    /// Copy a host directory tree into the container
    Import {
        #[arg(value_name = "HOST_DIR")]
        host_dir: PathBuf,
        #[arg(default_value = "/")]
        prefix: String,
    },

    /// Delete the container file
    Destroy {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cask_config::config().clone();
    init_logging(config.logging.level.raised_by(cli.verbose));

    let command = match cli.command {
        Commands::Config { command } => return cmd_config(command, &config),
        command => command,
    };

    let container = cli.container.unwrap_or_else(|| config.container.path.clone());
    let options = FsOptions {
        write_through: config.store.write_through,
        defragment_on_close: config.store.defragment_on_close,
    };

    if let Commands::Destroy { yes } = command {
        return cmd_destroy(&container, options, yes);
    }

    let mut fs = FileSystem::open_with(&container, options)
        .with_context(|| format!("Failed to open container {}", container.display()))?;
    let outcome = dispatch(&mut fs, &container, command);
    let closed = fs.close().context("Failed to close container");
    outcome.and(closed)
}

fn dispatch(fs: &mut FileSystem, container: &Path, command: Commands) -> Result<()> {
    match command {
        Commands::Mkdir { path, parents } => {
            if parents {
                import::ensure_directories(fs, &path)?;
            } else {
                fs.create_directory(&path)?;
            }
            Ok(())
        }
        Commands::Rmdir { path } => Ok(fs.remove_directory(&path)?),
        Commands::Touch { path } => Ok(fs.create_file(&path)?),
        Commands::Rm { path } => Ok(fs.remove_file(&path)?),
        Commands::Write { path, source } => {
            let bytes = read_input(source.as_deref())?;
            fs.create_file(&path)?;
            fs.write_to_file(&path, &bytes)?;
            info!(path = %path, size = bytes.len(), "Wrote file");
            Ok(())
        }
        Commands::Append { path, source } => {
            let bytes = read_input(source.as_deref())?;
            fs.create_file(&path)?;
            fs.append_to_file(&path, &bytes)?;
            info!(path = %path, appended = bytes.len(), "Appended to file");
            Ok(())
        }
        Commands::Cat { path } => {
            let bytes = fs.read_file(&path)?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
            Ok(())
        }
        Commands::Ls { path, long } => cmd_ls(fs, &path, long),
        Commands::Mv {
            source,
            destination,
        } => Ok(fs.move_node(&source, &destination)?),
        Commands::Rename { path, new_name } => Ok(fs.rename(&path, &new_name)?),
        Commands::Size { path } => {
            println!("{}", fs.file_size(&path)?);
            Ok(())
        }
        Commands::Stat { path: Some(path) } => cmd_stat_path(fs, &path),
        Commands::Stat { path: None } => cmd_stat(fs, container),
        Commands::Defrag => {
            let report = fs.defragment()?;
            println!(
                "Defragmented: {} blocks moved, {} in use, container now {} bytes",
                report.moved_blocks, report.used_blocks, report.container_len
            );
            Ok(())
        }
        Commands::Import { host_dir, prefix } => {
            let summary = import::import_tree(fs, &host_dir, &prefix)?;
            println!(
                "Imported {} files ({} bytes) and {} directories into {}",
                summary.files, summary.bytes, summary.directories, prefix
            );
            Ok(())
        }
        Commands::Destroy { .. } | Commands::Config { .. } => {
            anyhow::bail!("Command must run without an open container")
        }
    }
}

/// Read a whole host file, or stdin when no file is given.
fn read_input(source: Option<&Path>) -> Result<Vec<u8>> {
    match source {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
        }
        None => {
            let mut bytes = Vec::new();
            io::stdin()
                .lock()
                .read_to_end(&mut bytes)
                .context("Failed to read stdin")?;
            Ok(bytes)
        }
    }
}

fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn cmd_ls(fs: &FileSystem, path: &str, long: bool) -> Result<()> {
    let mut names: Vec<String> = fs.directory_contents(path)?.into_iter().collect();
    names.sort();

    for name in names {
        let full = child_path(path, &name);
        let is_dir = fs.is_directory(&full)?;
        match (long, is_dir) {
            (false, true) => println!("{}/", name),
            (false, false) => println!("{}", name),
            (true, true) => println!("d {:>12} {}/", "-", name),
            (true, false) => println!("f {:>12} {}", fs.file_size(&full)?, name),
        }
    }
    Ok(())
}

fn cmd_stat_path(fs: &FileSystem, path: &str) -> Result<()> {
    println!("path:   {}", path);
    if fs.is_directory(path)? {
        println!("type:   directory");
        println!("items:  {}", fs.directory_contents(path)?.len());
    } else {
        println!("type:   file");
        println!("size:   {}", fs.file_size(path)?);
        println!("blocks: {:?}", fs.file_blocks(path)?);
    }
    Ok(())
}

fn cmd_stat(fs: &FileSystem, container: &Path) -> Result<()> {
    let stats = fs.stats()?;
    println!("Container:   {}", container.display());
    println!("Files:       {}", stats.files);
    println!("Directories: {}", stats.directories);
    println!("Bytes:       {}", stats.total_bytes);
    println!("Used blocks: {}", stats.used_blocks);
    println!("Free blocks: {}", stats.free_blocks);
    println!("Length:      {}", stats.container_len);
    println!("Header:      {} / {} bytes", stats.header_bytes, HEADER_SIZE);
    Ok(())
}

fn cmd_destroy(container: &Path, options: FsOptions, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!(
            "Refusing to delete {} without --yes",
            container.display()
        );
    }
    if !container.exists() {
        anyhow::bail!("No container at {}", container.display());
    }
    let fs = FileSystem::open_with(container, options)
        .with_context(|| format!("Failed to open container {}", container.display()))?;
    fs.delete_container()
        .with_context(|| format!("Failed to delete {}", container.display()))?;
    println!("Deleted {}", container.display());
    Ok(())
}

fn cmd_config(command: ConfigCommands, config: &Config) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(path) => println!("Global:  {}", path.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", Config::project_config_path().display());
        }
    }
    Ok(())
}
