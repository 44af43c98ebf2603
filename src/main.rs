//! Command-line entry point.
//!
//! Dispatches on the mode flags: `-c` builds an archive from filesystem
//! paths, `-l`/`-v` list an existing archive, and the default extracts
//! matching entries to files (or stdout with `-p`).

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use zipforge::{Archive, ArchiveOptions, Cli, Entry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.create {
        return create_archive(&cli);
    }

    let mut archive = open_archive(&cli)?;
    if cli.list || cli.verbose {
        return list_entries(&archive, cli.verbose);
    }
    extract_entries(&mut archive, &cli)
}

fn open_archive(cli: &Cli) -> Result<Archive> {
    let mut options = ArchiveOptions::default();
    if let Some(pw) = &cli.password {
        options.password = Some(pw.clone().into_bytes());
    }
    Archive::open_with(&cli.file, options).with_context(|| format!("cannot open {}", cli.file))
}

/// Build (or replace) the archive from the FILES arguments, recursing
/// into directories.
fn create_archive(cli: &Cli) -> Result<()> {
    if cli.files.is_empty() {
        bail!("nothing to add; list files and directories after the archive name");
    }

    let options = ArchiveOptions {
        level: cli.level.into(),
        parallel: !cli.no_parallel,
        ..ArchiveOptions::default()
    };
    let mut archive = Archive::with_options(options);
    archive.set_segment_size(cli.segment_size)?;
    if let Some(pw) = &cli.password {
        archive.set_password(Some(pw.clone().into_bytes()));
    }

    for path in &cli.files {
        add_path(&mut archive, Path::new(path), cli)?;
    }

    let summary = archive
        .save_to_file(&cli.file)
        .with_context(|| format!("cannot write {}", cli.file))?;

    if !cli.is_quiet() {
        let written: u64 = summary.entries.iter().map(|e| e.compressed_size).sum();
        let volumes = if summary.total_disks > 1 {
            format!(" across {} volumes", summary.total_disks)
        } else {
            String::new()
        };
        eprintln!(
            "{}: {} entries, {} of compressed data{volumes}",
            cli.file,
            summary.entries.len(),
            format_size(written)
        );
    }
    Ok(())
}

/// Queue one filesystem path. Directories are walked in name order so
/// repeated runs produce identical archives.
fn add_path(archive: &mut Archive, path: &Path, cli: &Cli) -> Result<()> {
    let meta = fs::metadata(path).with_context(|| format!("cannot read {}", path.display()))?;
    let name = archive_name(path);
    if name.is_empty() {
        bail!("cannot derive an entry name from '{}'", path.display());
    }

    if meta.is_dir() {
        if !cli.is_quiet() {
            println!("  adding: {name}/");
        }
        archive.add_directory(name)?;
        let mut children: Vec<PathBuf> = fs::read_dir(path)
            .with_context(|| format!("cannot read {}", path.display()))?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        children.sort();
        for child in children {
            add_path(archive, &child, cli)?;
        }
    } else {
        if !cli.is_quiet() {
            println!("  adding: {name}");
        }
        archive
            .add_entry_from_file(path, name)
            .with_context(|| format!("cannot queue {}", path.display()))?;
    }
    Ok(())
}

/// Archive name for a filesystem path: forward slashes, no leading `./`
/// or root.
fn archive_name(path: &Path) -> String {
    let mut name = path.to_string_lossy().replace('\\', "/");
    while let Some(rest) = name.strip_prefix("./") {
        name = rest.to_string();
    }
    name.trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

/// List archive contents.
///
/// Simple format (`-l`) prints one name per line; verbose (`-v`) prints
/// a table with sizes, compression ratio, timestamp, and an `*` marker
/// on encrypted entries.
fn list_entries(archive: &Archive, verbose: bool) -> Result<()> {
    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in archive.entries() {
        if verbose {
            let uncompressed = entry.uncompressed_size().unwrap_or(0);
            let compressed = entry.compressed_size().unwrap_or(0);
            let dos = entry.dos_datetime();
            let (year, month, day) = dos.ymd();
            let (hour, minute, _second) = dos.hms();

            let ratio = if uncompressed > 0 {
                format!(
                    "{:>4}%",
                    100u64.saturating_sub(compressed * 100 / uncompressed)
                )
            } else {
                "  0%".to_string()
            };
            let marker = if entry.is_encrypted() { "*" } else { " " };

            println!(
                "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02} {}{}",
                uncompressed,
                compressed,
                ratio,
                year,
                month,
                day,
                hour,
                minute,
                marker,
                entry.name()
            );

            if !entry.is_directory() {
                total_uncompressed += uncompressed;
                total_compressed += compressed;
                file_count += 1;
            }
        } else {
            println!("{}", entry.name());
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        let total_ratio = if total_uncompressed > 0 {
            format!(
                "{:>4}%",
                100u64.saturating_sub(total_compressed * 100 / total_uncompressed)
            )
        } else {
            "  0%".to_string()
        };
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed, total_compressed, total_ratio, "", file_count
        );
    }

    Ok(())
}

/// Extract every entry that passes the name and exclusion filters.
fn extract_entries(archive: &mut Archive, cli: &Cli) -> Result<()> {
    let password = cli.password.as_ref().map(|p| p.clone().into_bytes());
    let selected: Vec<String> = archive
        .entries()
        .iter()
        .filter(|e| selected_for_extract(e, cli))
        .map(|e| e.name().to_string())
        .collect();

    let multiple = cli.pipe && selected.len() > 1;
    for name in &selected {
        extract_one(archive, name, cli, password.as_deref(), multiple)?;
    }
    Ok(())
}

/// Apply the positional-name and `-x` filters to one entry.
///
/// Names without wildcards match the full entry path or the basename;
/// names with `*`/`?` go through [`glob_match`].
fn selected_for_extract(entry: &Entry, cli: &Cli) -> bool {
    if entry.is_directory() {
        return false;
    }

    if !cli.files.is_empty() {
        let matched = cli.files.iter().any(|f| {
            if has_glob_chars(f) {
                glob_match(f, entry.name())
            } else {
                let basename = Path::new(entry.name())
                    .file_name()
                    .map(|s| s.to_string_lossy())
                    .unwrap_or_default();
                entry.name() == f.as_str() || basename == *f
            }
        });
        if !matched {
            return false;
        }
    }

    !cli.exclude
        .iter()
        .any(|x| entry.name().contains(x.as_str()) || glob_match(x, entry.name()))
}

/// Extract a single entry, honoring pipe mode, the output directory,
/// junked paths, and the overwrite flags.
fn extract_one(
    archive: &mut Archive,
    name: &str,
    cli: &Cli,
    password: Option<&[u8]>,
    show_filename: bool,
) -> Result<()> {
    if cli.pipe {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        if show_filename {
            lock.write_all(format!("--- {name} ---\n").as_bytes())?;
        }
        archive
            .extract_to(name, &mut lock, password)
            .with_context(|| format!("cannot extract {name}"))?;
        lock.flush()?;
        return Ok(());
    }

    if is_unsafe_name(name) {
        if !cli.is_very_quiet() {
            eprintln!("Skipping: {name} (unsafe path)");
        }
        return Ok(());
    }

    let file_name = if cli.junk_paths {
        Path::new(name)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string())
    } else {
        name.to_string()
    };
    let output_path = match &cli.extract_dir {
        Some(dir) => PathBuf::from(dir).join(&file_name),
        None => PathBuf::from(&file_name),
    };

    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_very_quiet() {
                eprintln!("Skipping: {name} (file exists)");
            }
            return Ok(());
        }
        if !cli.overwrite {
            if !cli.is_very_quiet() {
                eprintln!("Skipping: {name} (use -o to overwrite)");
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {name}");
    }

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }
    let mut out = fs::File::create(&output_path)
        .with_context(|| format!("cannot create {}", output_path.display()))?;
    archive
        .extract_to(name, &mut out, password)
        .with_context(|| format!("cannot extract {name}"))?;
    Ok(())
}

/// Entry names that would land outside the extraction directory.
fn is_unsafe_name(name: &str) -> bool {
    let path = Path::new(name);
    path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Simple glob matching: `*` matches zero or more characters, `?`
/// matches exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
