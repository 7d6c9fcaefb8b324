#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::significant_drop_tightening
)]

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sharefs::config::{ensure_password, AppConfig};
use sharefs::download::ParallelDownloader;
use sharefs::utils::{file_name, glob_match, join_path, parent_path};
use sharefs::{ConnectionDescriptor, ConnectionResult, FileEntry, StorageAccess, StorageType};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Saved connection to use, by name or id (defaults to the first one)
    #[arg(short, long, global = true)]
    connection: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    List {
        /// Directory, relative to the connection folder unless absolute
        #[arg(default_value = "")]
        path: String,

        #[arg(short, long, value_enum, default_value = "name")]
        sort: SortKey,

        /// Reverse sort order
        #[arg(short, long)]
        reverse: bool,

        /// Bypass the listing cache
        #[arg(long)]
        reload: bool,
    },

    /// Show one remote entry
    Stat { path: String },

    /// Download files (the last path segment may contain wildcards)
    Get {
        path: String,

        /// Local destination directory
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,

        /// Resume from this byte offset (single file only)
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Upload local files
    Put {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination directory on the server
        #[arg(short, long, default_value = "")]
        dest: String,

        /// Append to existing remote files instead of replacing them
        #[arg(long)]
        append: bool,
    },

    /// Create a directory
    Mkdir { path: String },

    /// Create an empty file
    Touch { path: String },

    /// Delete a file or a directory tree
    Rm { path: String },

    /// Rename or move within one connection
    Mv { from: String, to: String },

    /// Test a saved connection
    Check,

    /// Manage saved connections
    Connection {
        #[command(subcommand)]
        action: ConnectionAction,
    },
}

#[derive(Subcommand)]
enum ConnectionAction {
    /// Test and save a connection
    Add {
        #[arg(long, value_enum)]
        protocol: Protocol,

        #[arg(long)]
        host: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Root folder, for SMB `share/dir`
        #[arg(long)]
        folder: Option<String>,

        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        domain: Option<String>,

        #[arg(long)]
        anonymous: bool,

        /// Resolve DFS referrals (SMB)
        #[arg(long)]
        dfs: bool,

        /// Upload through a temporary file and rename on completion
        #[arg(long)]
        safe_transfer: bool,

        /// Save even if the check fails
        #[arg(long)]
        force: bool,
    },

    /// Remove a saved connection
    Remove { key: String },

    /// List saved connections
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    Smb,
    Ftp,
    Sftp,
    Webdav,
    Webdavs,
}

impl From<Protocol> for StorageType {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Smb => Self::Smb,
            Protocol::Ftp => Self::Ftp,
            Protocol::Sftp => Self::Sftp,
            Protocol::Webdav => Self::WebDav,
            Protocol::Webdavs => Self::WebDavs,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortKey {
    Name,
    Size,
    Modified,
}

/// A resolved connection ready for use.
struct Target {
    access: Arc<StorageAccess>,
    descriptor: ConnectionDescriptor,
}

impl Target {
    fn open(config: &AppConfig, key: Option<&str>) -> Result<Self> {
        let descriptor = match key {
            Some(key) => config
                .find(key)
                .ok_or_else(|| anyhow!("no saved connection named '{}'", key))?,
            None => config
                .connections
                .first()
                .ok_or_else(|| anyhow!("no connections saved, run `sharefs connection add` first"))?,
        };
        let mut descriptor = descriptor.clone();
        ensure_password(&mut descriptor)?;
        let access = Arc::new(StorageAccess::new(config.settings.clone()));
        access.start_maintenance();
        Ok(Self { access, descriptor })
    }

    /// Relative paths are taken from the connection's folder.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            join_path("/", path)
        } else {
            join_path(&self.descriptor.root_folder(), path)
        }
    }
}

fn format_entry(entry: &FileEntry) -> String {
    let size = if entry.is_directory {
        "DIR".to_string()
    } else {
        entry
            .size
            .map_or_else(|| "?".to_string(), |s| human_bytes::human_bytes(s as f64))
    };
    let modified = entry
        .modified
        .map(|m| m.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();
    format!("{:<50} {:>10} {:>20}", entry.name, size, modified)
}

fn print_check(result: &ConnectionResult) {
    match result {
        ConnectionResult::Success => println!("✓ {}", result),
        ConnectionResult::Warning(_) => println!("⚠ {}", result),
        ConnectionResult::Failure(_) => println!("✗ {}", result),
    }
}

async fn upload(target: &Target, local: &Path, remote: &str, append: bool) -> Result<u64> {
    let mut input = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("opening {}", local.display()))?;
    let mut output = target
        .access
        .open_output_stream(&target.descriptor, remote, append)
        .await?;

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        if let Err(err) = output.write_all(&buffer[..n]).await {
            output.abort().await;
            return Err(err.into());
        }
    }
    Ok(output.finish().await?)
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load()?;

    match cli.command {
        Commands::Connection { action } => manage_connections(&mut config, action).await,
        Commands::Check => {
            let target = Target::open(&config, cli.connection.as_deref())?;
            let result = target.access.check_connection(&target.descriptor).await;
            print_check(&result);
            target.access.close_all().await;
            if matches!(result, ConnectionResult::Failure(_)) {
                bail!("connection check failed");
            }
            Ok(())
        }
        command => {
            let target = Target::open(&config, cli.connection.as_deref())?;
            let outcome = run_command(&target, command).await;
            target.access.close_all().await;
            outcome
        }
    }
}

async fn run_command(target: &Target, command: Commands) -> Result<()> {
    let access = &target.access;
    let descriptor = &target.descriptor;

    match command {
        Commands::List {
            path,
            sort,
            reverse,
            reload,
        } => {
            let path = target.resolve(&path);
            let listing = if reload {
                access.reload_children(descriptor, &path).await?
            } else {
                access.list_children(descriptor, &path).await?
            };
            let mut files = listing.to_vec();
            match sort {
                SortKey::Name => files.sort_by_key(|f| f.name.to_lowercase()),
                SortKey::Size => files.sort_by_key(|f| f.size),
                SortKey::Modified => files.sort_by_key(|f| std::cmp::Reverse(f.modified)),
            }
            if reverse {
                files.reverse();
            }

            println!("Files in {}:", descriptor.file_uri(&path));
            println!("{:<50} {:>10} {:>20}", "Name", "Size", "Modified");
            println!("{}", "-".repeat(82));
            for file in &files {
                println!("{}", format_entry(file));
            }
        }
        Commands::Stat { path } => {
            let entry = access.stat_file(descriptor, &target.resolve(&path)).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::Get { path, dest, offset } => {
            let path = target.resolve(&path);
            let pattern = file_name(&path);
            if pattern.contains('*') {
                let dir = parent_path(&path);
                let listing = access.list_children(descriptor, &dir).await?;
                let matching: Vec<(String, PathBuf)> = listing
                    .iter()
                    .filter(|f| !f.is_directory && glob_match(&f.name, &pattern))
                    .map(|f| (f.path.clone(), dest.join(&f.name)))
                    .collect();

                if matching.is_empty() {
                    println!("No files match pattern: {}", pattern);
                    return Ok(());
                }
                println!("Downloading {} files matching '{}'", matching.len(), pattern);

                let downloader = ParallelDownloader::new(Arc::clone(access), descriptor.clone(), 4);
                let results = downloader.download_files(matching).await;
                let successful = results.iter().filter(|r| r.is_ok()).count();
                for err in results.iter().filter_map(|r| r.as_ref().err()) {
                    eprintln!("✗ {:#}", err);
                }
                println!("Downloaded {}/{} files successfully", successful, results.len());
            } else {
                let local_path = dest.join(&pattern);
                println!("Downloading {} to {:?}", path, local_path);

                let mut input = access.open_input_stream_at(descriptor, &path, offset).await?;
                let mut output = if offset > 0 {
                    tokio::fs::OpenOptions::new().append(true).create(true).open(&local_path).await?
                } else {
                    tokio::fs::File::create(&local_path).await?
                };
                let copied = tokio::io::copy(&mut input, &mut output).await?;
                output.flush().await?;
                println!("Download complete! ({})", human_bytes::human_bytes(copied as f64));
            }
        }
        Commands::Put { files, dest, append } => {
            let dest = target.resolve(&dest);
            println!("Uploading {} files to {}", files.len(), dest);

            let mut successful = 0;
            let mut failed = 0;
            for file in files {
                let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                    eprintln!("Skipping {:?}: not a file name", file);
                    failed += 1;
                    continue;
                };
                let remote_path = join_path(&dest, name);
                print!("Uploading {:?} to {} ... ", file, remote_path);
                match upload(target, &file, &remote_path, append).await {
                    Ok(bytes) => {
                        println!("✓ {}", human_bytes::human_bytes(bytes as f64));
                        successful += 1;
                    }
                    Err(e) => {
                        println!("✗ Error: {:#}", e);
                        failed += 1;
                    }
                }
            }
            println!("\nUpload complete: {} successful, {} failed", successful, failed);
        }
        Commands::Mkdir { path } => {
            let entry = access.create_file(descriptor, &target.resolve(&path), true).await?;
            println!("Created {}", entry.path);
        }
        Commands::Touch { path } => {
            let entry = access.create_file(descriptor, &target.resolve(&path), false).await?;
            println!("Created {}", entry.path);
        }
        Commands::Rm { path } => {
            let path = target.resolve(&path);
            access.delete_file(descriptor, &path).await?;
            println!("Deleted {}", path);
        }
        Commands::Mv { from, to } => {
            let (from, to) = (target.resolve(&from), target.resolve(&to));
            let entry = access.rename_file(descriptor, &from, &to).await?;
            println!("Renamed {} -> {}", from, entry.path);
        }
        Commands::Check | Commands::Connection { .. } => {}
    }
    Ok(())
}

async fn manage_connections(config: &mut AppConfig, action: ConnectionAction) -> Result<()> {
    match action {
        ConnectionAction::Add {
            protocol,
            host,
            name,
            port,
            folder,
            user,
            domain,
            anonymous,
            dfs,
            safe_transfer,
            force,
        } => {
            let mut descriptor = ConnectionDescriptor::new(protocol.into(), host);
            if let Some(name) = name {
                descriptor.name = name;
            }
            descriptor.port = port;
            descriptor.folder = folder;
            descriptor.user = user;
            descriptor.domain = domain;
            descriptor.anonymous = anonymous;
            descriptor.enable_dfs = dfs;
            descriptor.safe_transfer = safe_transfer;
            let mut descriptor = descriptor.normalized();
            ensure_password(&mut descriptor)?;

            println!("Checking {} ...", descriptor.uri());
            let access = StorageAccess::new(config.settings.clone());
            let result = access.check_connection(&descriptor).await;
            access.close_all().await;
            print_check(&result);
            if matches!(result, ConnectionResult::Failure(_)) && !force {
                bail!("not saved, use --force to save anyway");
            }

            let id = config.upsert(descriptor)?;
            config.save()?;
            println!("Saved connection {}", id);
        }
        ConnectionAction::Remove { key } => {
            let removed = config
                .remove(&key)
                .ok_or_else(|| anyhow!("no saved connection named '{}'", key))?;
            config.save()?;
            println!("Removed {} ({})", removed.name, removed.uri());
        }
        ConnectionAction::Show => {
            if config.connections.is_empty() {
                println!("No saved connections.");
            }
            for c in &config.connections {
                let flags = [
                    (c.anonymous, "anonymous"),
                    (c.enable_dfs, "dfs"),
                    (c.safe_transfer, "safe-transfer"),
                ]
                .iter()
                .filter(|(on, _)| *on)
                .map(|(_, label)| *label)
                .collect::<Vec<_>>()
                .join(",");
                println!("{:>4}  {:<20} {:<8} {} {}", c.id, c.name, c.storage.to_string(), c.uri(), flags);
            }
            if let Some(path) = AppConfig::config_path() {
                println!("\nConfiguration: {}", path.display());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await
}
