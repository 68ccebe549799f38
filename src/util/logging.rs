/// Map the `-v` count onto a log filter: info by default, debug with one
/// `-v`, trace beyond that. `RUST_LOG` still overrides.
pub fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}
