//! OVFRemap CLI - Prepare unpacked OVF exports for import.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ovfremap_core::{
    files_to_transfer, inspect, recover, remap_with_progress, RemapOptions, RemapPhase,
    RemapProgress,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Give an unpacked OVF export fresh disk, group and template identities.
#[derive(Parser)]
#[command(name = "ovfremap")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log debug detail.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors and suppress progress output.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assign new identities to every disk, disk group and the descriptor.
    Remap {
        /// Root of the unpacked archive.
        archive_dir: PathBuf,

        /// New display name for the virtual machine.
        #[arg(short, long)]
        name: Option<String>,

        /// Keep network adapters in the descriptor.
        #[arg(long)]
        keep_nics: bool,

        /// Keep the existing disk and group ids.
        #[arg(long)]
        keep_disk_ids: bool,

        /// Keep the existing descriptor id and file name.
        #[arg(long)]
        keep_ovf_id: bool,
    },

    /// List the files to copy to the target store, descriptor last.
    Files {
        /// Root of the unpacked archive.
        archive_dir: PathBuf,
    },

    /// Display information about an unpacked archive.
    Info {
        /// Root of the unpacked archive.
        archive_dir: PathBuf,
    },

    /// Undo a remap that was interrupted while committing.
    Recover {
        /// Root of the unpacked archive.
        archive_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Remap {
            archive_dir,
            name,
            keep_nics,
            keep_disk_ids,
            keep_ovf_id,
        } => {
            let options = RemapOptions {
                strip_nics: !keep_nics,
                new_name: name,
                remap_disks: !keep_disk_ids,
                rename_descriptor: !keep_ovf_id,
            };
            run_remap(&archive_dir, options, cli.quiet)?;
        }
        Commands::Files { archive_dir } => {
            for file in files_to_transfer(&archive_dir)? {
                println!("{}", file.display());
            }
        }
        Commands::Info { archive_dir } => {
            show_info(&archive_dir)?;
        }
        Commands::Recover { archive_dir } => match recover(&archive_dir)? {
            None => println!("No interrupted remap found in {}", archive_dir.display()),
            Some(undone) => println!(
                "Recovered {}: {} operation(s) undone",
                archive_dir.display(),
                undone
            ),
        },
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run_remap(archive_dir: &Path, options: RemapOptions, quiet: bool) -> Result<()> {
    debug!(?options, "starting remap");

    // Set up progress tracking
    let progress_bar = if quiet {
        None
    } else {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} disks {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        Some(pb)
    };

    let callback: Option<ovfremap_core::ProgressCallback> = progress_bar.clone().map(|pb| {
        Box::new(move |progress: RemapProgress| {
            if progress.total_disks > 0 {
                pb.set_length(progress.total_disks as u64);
                pb.set_position(progress.current_disk as u64);
            }
            pb.set_message(phase_message(progress.phase));
        }) as ovfremap_core::ProgressCallback
    });

    let report = remap_with_progress(archive_dir, options, callback)
        .with_context(|| format!("failed to remap {}", archive_dir.display()))?;

    if let Some(pb) = progress_bar {
        pb.finish_with_message("Complete!");
    }

    if !quiet {
        println!();
        println!("Remap completed successfully");
        println!("----------------------------");
        println!("Descriptor: {}", report.descriptor_path.display());
        if let Some(id) = &report.descriptor_id {
            println!("Template:   {}", id);
        }
        println!("NICs removed: {}", report.nics_removed);
        if let Some(root) = &report.chain_root {
            println!("Chain root: {}", root);
        }
        println!();

        if !report.disks.is_empty() {
            println!("Disks:");
            for (i, disk) in report.disks.iter().enumerate() {
                println!(
                    "  {}. {}/{} -> {}",
                    i + 1,
                    disk.old_group_id,
                    disk.old_image_id,
                    disk.new_composite()
                );
            }
        }
    }

    Ok(())
}

fn phase_message(phase: RemapPhase) -> String {
    match phase {
        RemapPhase::Complete => "Complete!".to_string(),
        other => format!("{}...", other),
    }
}

fn show_info(archive_dir: &Path) -> Result<()> {
    let info = inspect(archive_dir)?;

    println!("Archive Information");
    println!("===================");
    println!();
    println!("Descriptor: {}", info.descriptor.display());
    println!("Name:       {}", info.name.as_deref().unwrap_or("-"));
    println!("Template:   {}", info.template_id.as_deref().unwrap_or("-"));
    println!("NICs:       {}", info.nics);
    println!();

    if info.disks.is_empty() {
        println!("Disks:      None");
    } else {
        println!("Disks:");
        for (i, disk) in info.disks.iter().enumerate() {
            let parent = disk
                .parent
                .as_deref()
                .map(|p| format!(" (parent {})", p))
                .unwrap_or_default();
            println!(
                "  {}. {}/{} - {}{}",
                i + 1,
                disk.group_id,
                disk.image_id,
                format_bytes(disk.size_bytes),
                parent
            );
        }
        println!();
        println!("Total disk size: {}", format_bytes(info.total_disk_size));
    }

    Ok(())
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
