use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use log::LevelFilter;

static INIT_LOGGER: Once = Once::new();
static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide `env_logger`. `RUST_LOG` still overrides `level`
/// per module. Later calls are no-ops.
pub fn init_logger(level: LevelFilter, file: Option<&Path>) {
    if LOGGER_INITIALIZED.load(Ordering::SeqCst) {
        return;
    }
    INIT_LOGGER.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level);
        builder.parse_default_env();
        if let Some(path) = file {
            match File::create(path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => eprintln!("cannot open log file {}: {}", path.display(), e),
            }
        }
        let _ = builder.try_init();
        LOGGER_INITIALIZED.store(true, Ordering::SeqCst);
    });
}

pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.load(Ordering::SeqCst)
}
