use clap::Parser;

use crate::deflate::CompressionLevel;

#[derive(Parser, Debug)]
#[command(name = "zipforge")]
#[command(version)]
#[command(about = "Create, inspect, and extract ZIP archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipforge -l data.zip                list files in data.zip\n  \
  zipforge data.zip -x notes.txt      extract all files except notes.txt\n  \
  zipforge -p data.zip | more         send contents of data.zip via pipe into more\n  \
  zipforge -c data.zip src/ README.md          build data.zip from a tree and a file\n  \
  zipforge -c -P secret -s 10M big.zip big.iso encrypt and split into 10 MB volumes")]
pub struct Cli {
    /// ZIP archive path
    #[arg(value_name = "ARCHIVE")]
    pub file: String,

    /// Entries to extract, or paths to add with -c (default: all)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// Create the archive from FILES instead of extracting
    #[arg(short = 'c')]
    pub create: bool,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Exclude files that follow
    #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Password for encrypted entries, or for entries added with -c
    #[arg(short = 'P', value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Split the archive into volumes of SIZE (e.g. 64k, 10M); -c only
    #[arg(short = 's', value_name = "SIZE", value_parser = parse_size)]
    pub segment_size: Option<u64>,

    /// Compression level for -c
    #[arg(long = "level", value_enum, default_value = "normal")]
    pub level: LevelArg,

    /// Compress on the calling thread only
    #[arg(long = "no-parallel")]
    pub no_parallel: bool,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }
}

/// Compression level as spelled on the command line.
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum LevelArg {
    None,
    Fastest,
    Normal,
    Best,
}

impl From<LevelArg> for CompressionLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::None => CompressionLevel::None,
            LevelArg::Fastest => CompressionLevel::Fastest,
            LevelArg::Normal => CompressionLevel::Normal,
            LevelArg::Best => CompressionLevel::Best,
        }
    }
}

/// Parse a size like `500`, `64k`, `10M`, or `2G` into bytes.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, mult) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    n.checked_mul(mult)
        .ok_or_else(|| format!("size '{s}' is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("500").unwrap(), 500);
        assert_eq!(parse_size("64k").unwrap(), 65_536);
        assert_eq!(parse_size("64K").unwrap(), 65_536);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("99999999999999999999G").is_err());
    }
}
