// Command-line front end for CAR archives.
//
// One subcommand per archive operation. Errors go to stderr prefixed with
// `rescar:`; machine-readable output is available with `--json`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};

use crate::archive::{Archive, LoadMode, OpenOptions};
use crate::format::header::{self, CAR_VERSION, HEADER_SIZE, TAG_HEADER_SIZE, Tag};
use crate::io::{self as car_io, BuildOptions, IoError};
use crate::loader;

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
/// Internal software error (sysexits `EX_SOFTWARE`): the build's layout
/// check failed.
const EXIT_SOFTWARE: i32 = 70;

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Resource archive (CAR) tool.
#[derive(Parser, Debug)]
#[command(
    name = "rescar",
    version,
    about = "Build, inspect and extract CAR resource archives",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Quiet mode (errors only).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use twice for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Machine-readable JSON output.
    #[arg(long = "json", global = true)]
    json_output: bool,

    /// Read archives into memory instead of memory-mapping them.
    #[arg(long = "no-mmap", global = true)]
    no_mmap: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create an archive, or update it if it already exists.
    Build(BuildArgs),
    /// Extract every entry into a directory.
    Extract(ExtractArgs),
    /// List entry sizes and names.
    List(ArchiveArg),
    /// Write one entry's bytes to stdout.
    Cat(CatArgs),
    /// Print the archive index.
    Dump(ArchiveArg),
    /// Print build/configuration details.
    Config,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Archive to create or update.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: PathBuf,

    /// Files to add; each is stored under its base name.
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    files: Vec<PathBuf>,

    /// Directory in which to stage files (default: system temp dir).
    #[arg(long = "scratch-dir", value_hint = ValueHint::DirPath)]
    scratch_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Archive to extract.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: PathBuf,

    /// Destination directory.
    #[arg(short = 'C', long = "directory", default_value = ".", value_hint = ValueHint::DirPath)]
    directory: PathBuf,
}

#[derive(Args, Debug)]
struct ArchiveArg {
    /// Archive file.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: PathBuf,
}

#[derive(Args, Debug)]
struct CatArgs {
    /// Archive file.
    #[arg(value_hint = ValueHint::FilePath)]
    archive: PathBuf,

    /// Entry name, e.g. `main.lu`.
    name: String,

    /// Treat NAME as a module name and append the script extension.
    #[arg(short = 'm', long)]
    module: bool,
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Build,
    Extract,
    List,
    Cat,
    Dump,
    Config,
}

#[derive(Debug)]
struct Options {
    command: Command,
    quiet: bool,
    verbose: u8,
    json_output: bool,
    open: OpenOptions,
    archive: Option<PathBuf>,
    files: Vec<PathBuf>,
    directory: PathBuf,
    entry_name: Option<String>,
    scratch_dir: Option<PathBuf>,
}

fn resolve_options(cli: Cli) -> Options {
    let open = OpenOptions {
        load: if cli.no_mmap {
            LoadMode::Read
        } else {
            LoadMode::default()
        },
    };
    let mut opts = Options {
        command: Command::Config,
        quiet: cli.quiet,
        verbose: cli.verbose.min(2),
        json_output: cli.json_output,
        open,
        archive: None,
        files: Vec::new(),
        directory: PathBuf::from("."),
        entry_name: None,
        scratch_dir: None,
    };

    match cli.command {
        Cmd::Build(args) => {
            opts.command = Command::Build;
            opts.archive = Some(args.archive);
            opts.files = args.files;
            opts.scratch_dir = args.scratch_dir;
        }
        Cmd::Extract(args) => {
            opts.command = Command::Extract;
            opts.archive = Some(args.archive);
            opts.directory = args.directory;
        }
        Cmd::List(args) => {
            opts.command = Command::List;
            opts.archive = Some(args.archive);
        }
        Cmd::Cat(args) => {
            opts.command = Command::Cat;
            opts.archive = Some(args.archive);
            opts.entry_name = Some(if args.module {
                loader::module_file_name(&args.name)
            } else {
                args.name
            });
        }
        Cmd::Dump(args) => {
            opts.command = Command::Dump;
            opts.archive = Some(args.archive);
        }
        Cmd::Config => {}
    }
    opts
}

fn log_filter(opts: &Options) -> &'static str {
    if opts.quiet {
        return "error";
    }
    match opts.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("rescar".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        let opts = resolve_options(cli);
        let _ = log_filter(&opts);
    }
}

fn archive_path(opts: &Options) -> &Path {
    // Every archive subcommand has a required ARCHIVE argument.
    opts.archive.as_deref().unwrap_or(Path::new(""))
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("rescar: json: {e}"),
    }
}

fn open_archive(opts: &Options) -> Result<Archive, i32> {
    let path = archive_path(opts);
    Archive::open_path_with(path, opts.open).map_err(|e| {
        eprintln!("rescar: {}: {e}", path.display());
        EXIT_FAILURE
    })
}

// ---------------------------------------------------------------------------
// Config command
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("rescar version {version} (Rust)");

    let mmap = cfg!(feature = "mmap") as u8;
    let ptr_size = std::mem::size_of::<*const ()>();

    eprintln!("MMAP={mmap}");
    eprintln!("CAR_VERSION={CAR_VERSION}");
    eprintln!("HEADER_SIZE={HEADER_SIZE}");
    eprintln!("TAG_HEADER_SIZE={TAG_HEADER_SIZE}");
    eprintln!("TAG_CONTENTS={}", Tag::CONTENTS);
    eprintln!("TAG_DATA={}", Tag::DATA);
    eprintln!("TAG_EOF={:#010X}", Tag::EOF);
    eprintln!("SCRIPT_EXTENSION={}", header::SCRIPT_EXTENSION);
    eprintln!("MAX_ARCHIVE_SIZE={}", u32::MAX);
    eprintln!("sizeof(usize)={ptr_size}");

    EXIT_OK
}

// ---------------------------------------------------------------------------
// Build command
// ---------------------------------------------------------------------------

fn cmd_build(opts: &Options) -> i32 {
    let archive = archive_path(opts);
    let build_opts = BuildOptions {
        scratch_root: opts.scratch_dir.clone(),
        open: opts.open,
        ..BuildOptions::default()
    };

    let stats = match car_io::build_archive(archive, &opts.files, &build_opts) {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("rescar: {}: {e}", archive.display());
            return if e.is_layout_violation() {
                EXIT_SOFTWARE
            } else {
                EXIT_FAILURE
            };
        }
    };

    if opts.json_output {
        let skipped: Vec<String> = stats
            .skipped
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        print_json(&serde_json::json!({
            "archive": archive.display().to_string(),
            "entries": stats.entries,
            "preserved": stats.preserved,
            "added": stats.added,
            "replaced": stats.replaced,
            "skipped": skipped,
            "dropped": stats.dropped,
            "archive_size": stats.archive_size,
        }));
    } else if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "rescar: {}: {} entries ({} kept, {} added, {} replaced, {} skipped, {} dropped), {} bytes",
            archive.display(),
            stats.entries,
            stats.preserved,
            stats.added,
            stats.replaced,
            stats.skipped.len(),
            stats.dropped,
            stats.archive_size
        );
    }

    if stats.skipped.is_empty() && stats.dropped == 0 {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

// ---------------------------------------------------------------------------
// Extract command
// ---------------------------------------------------------------------------

fn cmd_extract(opts: &Options) -> i32 {
    let archive = archive_path(opts);
    let stats = match car_io::extract_archive(&opts.directory, archive, opts.open) {
        Ok(stats) => stats,
        Err(e) => {
            report(archive, &e);
            return EXIT_FAILURE;
        }
    };

    if opts.json_output {
        print_json(&serde_json::json!({
            "archive": archive.display().to_string(),
            "directory": opts.directory.display().to_string(),
            "files": stats.files,
            "bytes_written": stats.bytes_written,
            "skipped": stats.skipped,
        }));
    } else if !opts.quiet {
        for name in &stats.files {
            println!("{}", opts.directory.join(name).display());
        }
    }

    if stats.skipped == 0 {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

fn report(archive: &Path, e: &IoError) {
    eprintln!("rescar: {}: {e}", archive.display());
}

// ---------------------------------------------------------------------------
// List command
// ---------------------------------------------------------------------------

fn cmd_list(opts: &Options) -> i32 {
    let archive = match open_archive(opts) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let listed = archive.list();

    if opts.json_output {
        let entries: Vec<serde_json::Value> = listed
            .iter()
            .map(|e| serde_json::json!({ "name": e.name, "length": e.length }))
            .collect();
        print_json(&serde_json::Value::Array(entries));
    } else {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for e in &listed {
            if let Err(e) = writeln!(out, "{:>7} {}", e.length, e.name) {
                eprintln!("rescar: write error: {e}");
                return EXIT_FAILURE;
            }
        }
    }

    if listed.len() == archive.len() {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

// ---------------------------------------------------------------------------
// Cat command
// ---------------------------------------------------------------------------

fn cmd_cat(opts: &Options) -> i32 {
    let archive = match open_archive(opts) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let name = opts.entry_name.as_deref().unwrap_or_default();

    match archive.lookup(name) {
        Ok(Some(bytes)) => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            if let Err(e) = out.write_all(bytes).and_then(|()| out.flush()) {
                eprintln!("rescar: write error: {e}");
                return EXIT_FAILURE;
            }
            EXIT_OK
        }
        Ok(None) => {
            eprintln!("rescar: resource ({name}) does not exist in archive");
            EXIT_FAILURE
        }
        Err(e) => {
            eprintln!("rescar: {e}");
            EXIT_FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Dump command
// ---------------------------------------------------------------------------

fn cmd_dump(opts: &Options) -> i32 {
    let archive = match open_archive(opts) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let path = archive_path(opts);

    if opts.json_output {
        let entries: Vec<serde_json::Value> = archive
            .entries()
            .enumerate()
            .map(|(i, e)| {
                serde_json::json!({
                    "index": i,
                    "kind": e.kind.to_u32(),
                    "offset": e.offset,
                    "name": e.name,
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "archive": path.display().to_string(),
            "version": CAR_VERSION,
            "size": archive.as_bytes().len(),
            "data_start": archive.data_start(),
            "mapped": archive.backing().is_mapped(),
            "entries": entries,
        }));
        return EXIT_OK;
    }

    println!("archive:     {}", path.display());
    println!("version:     {CAR_VERSION}");
    println!("size:        {}", archive.as_bytes().len());
    println!("entries:     {}", archive.len());
    println!("data start:  {}", archive.data_start());
    println!("mapped:      {}", archive.backing().is_mapped());
    for (i, e) in archive.entries().enumerate() {
        println!(
            "  [{i:>4}] {:<8} offset {:>10}  {}",
            e.kind.to_string(),
            e.offset,
            e.name
        );
    }

    if opts.verbose >= 2 {
        println!();
        println!("contents section:");
        let contents = &archive.as_bytes()[HEADER_SIZE..archive.data_start()];
        print!("{}", hexdump(contents, HEADER_SIZE));
    }
    EXIT_OK
}

/// Classic 16-bytes-per-line hex dump; `base` is the offset of `bytes[0]`.
fn hexdump(bytes: &[u8], base: usize) -> String {
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", base + line * 16));
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => out.push_str(&format!("{b:02x} ")),
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(&opts)))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let exit_code = match opts.command {
        Command::Build => cmd_build(&opts),
        Command::Extract => cmd_extract(&opts),
        Command::List => cmd_list(&opts),
        Command::Cat => cmd_cat(&opts),
        Command::Dump => cmd_dump(&opts),
        Command::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_opts(args: &[&str]) -> Options {
        let argv: Vec<String> = std::iter::once("rescar".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        let cli = Cli::try_parse_from(argv).expect("cli parse failed");
        resolve_options(cli)
    }

    #[test]
    fn build_subcommand_maps_correctly() {
        let opts = parse_opts(&["build", "app.car", "main.lu", "util.lu"]);
        assert_eq!(opts.command, Command::Build);
        assert_eq!(opts.archive, Some(PathBuf::from("app.car")));
        assert_eq!(
            opts.files,
            vec![PathBuf::from("main.lu"), PathBuf::from("util.lu")]
        );
        assert!(opts.scratch_dir.is_none());
    }

    #[test]
    fn build_requires_files() {
        let argv = ["rescar", "build", "app.car"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn build_scratch_dir() {
        let opts = parse_opts(&["build", "--scratch-dir", "/tmp/s", "a.car", "x.lu"]);
        assert_eq!(opts.scratch_dir, Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn extract_directory_defaults_to_cwd() {
        let opts = parse_opts(&["extract", "app.car"]);
        assert_eq!(opts.command, Command::Extract);
        assert_eq!(opts.directory, PathBuf::from("."));

        let opts = parse_opts(&["extract", "app.car", "-C", "out"]);
        assert_eq!(opts.directory, PathBuf::from("out"));
    }

    #[test]
    fn cat_module_appends_extension() {
        let opts = parse_opts(&["cat", "app.car", "main.lu"]);
        assert_eq!(opts.entry_name.as_deref(), Some("main.lu"));

        let opts = parse_opts(&["cat", "--module", "app.car", "game.level1"]);
        assert_eq!(opts.entry_name.as_deref(), Some("game.level1.lu"));
    }

    #[test]
    fn global_flags() {
        let opts = parse_opts(&["--json", "--no-mmap", "list", "app.car"]);
        assert_eq!(opts.command, Command::List);
        assert!(opts.json_output);
        assert_eq!(opts.open.load, LoadMode::Read);

        let opts = parse_opts(&["dump", "app.car", "-q"]);
        assert_eq!(opts.command, Command::Dump);
        assert!(opts.quiet);
        assert_eq!(log_filter(&opts), "error");
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        let argv = ["rescar", "-q", "-v", "list", "a.car"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn verbose_is_capped() {
        let opts = parse_opts(&["-v", "-v", "-v", "list", "a.car"]);
        assert_eq!(opts.verbose, 2);
        assert_eq!(log_filter(&opts), "debug");
        assert_eq!(log_filter(&parse_opts(&["-v", "list", "a.car"])), "info");
        assert_eq!(log_filter(&parse_opts(&["list", "a.car"])), "warn");
    }

    #[test]
    fn config_command_maps() {
        assert_eq!(parse_opts(&["config"]).command, Command::Config);
    }

    #[test]
    fn hexdump_layout() {
        let dump = hexdump(b"rac\x01ABCDEFGHIJKLMNOP", 0);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  72 61 63 01 41 42 43 44  45"));
        assert!(lines[0].ends_with("|rac.ABCDEFGHIJKL|"));
        assert!(lines[1].starts_with("00000010  4d 4e 4f 50"));
        assert!(lines[1].ends_with("|MNOP|"));
    }

    #[test]
    fn fuzz_parse_does_not_panic() {
        fuzz_try_parse_args(&["build".into()]);
        fuzz_try_parse_args(&["--json".into(), "dump".into(), "x".into()]);
        fuzz_try_parse_args(&["\u{0}".into()]);
    }
}
