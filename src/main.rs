fn main() {
    #[cfg(feature = "cli")]
    rescar::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("rescar: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
