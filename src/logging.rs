use std::path::Path;

pub const LOG_FILE_BASENAME: &str = "battle-plan";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const LOG_ROTATE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
pub const LOG_ROTATE_KEEP_FILES: usize = 30;
pub const LOG_ENV_VAR: &str = "BATTLE_PLAN_LOG";

/// Log files live next to data.json/settings.json.
pub fn log_directory(data_dir: &Path) -> &Path {
    data_dir
}

pub fn default_log_spec() -> &'static str {
    if cfg!(debug_assertions) {
        "warn,battle_plan_lib=debug"
    } else {
        "warn,battle_plan_lib=info"
    }
}

/// `BATTLE_PLAN_LOG`, then `RUST_LOG`, then the built-in default. Blank values are skipped.
pub fn resolve_log_spec(app_var: Option<String>, rust_log: Option<String>) -> String {
    app_var
        .filter(|value| !value.trim().is_empty())
        .or_else(|| rust_log.filter(|value| !value.trim().is_empty()))
        .unwrap_or_else(|| default_log_spec().to_string())
}

#[cfg(all(feature = "app", not(test)))]
pub fn init_logging(data_dir: &Path) -> Result<(), flexi_logger::FlexiLoggerError> {
    use flexi_logger::{
        detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming, WriteMode,
    };

    std::fs::create_dir_all(data_dir)?;

    // Dependencies (reqwest, hyper, rustls) stay at WARN unless overridden.
    let spec = resolve_log_spec(
        std::env::var(LOG_ENV_VAR).ok(),
        std::env::var("RUST_LOG").ok(),
    );

    Logger::try_with_str(spec)?
        .log_to_file(
            FileSpec::default()
                .directory(log_directory(data_dir))
                .basename(LOG_FILE_BASENAME)
                .suffix(LOG_FILE_SUFFIX),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .format_for_files(detailed_format)
        .rotate(
            Criterion::Size(LOG_ROTATE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(LOG_ROTATE_KEEP_FILES),
        )
        // No window to show errors in; the terminal or service manager gets
        // warnings even in release builds.
        .duplicate_to_stderr(if cfg!(debug_assertions) {
            Duplicate::Info
        } else {
            Duplicate::Warn
        })
        .start()?;

    install_panic_hook();

    log::info!(
        "logger initialized dir={} rotate_size_bytes={} keep_files={}",
        log_directory(data_dir).display(),
        LOG_ROTATE_SIZE_BYTES,
        LOG_ROTATE_KEEP_FILES
    );
    Ok(())
}

#[cfg(all(feature = "app", not(test)))]
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info: &std::panic::PanicHookInfo<'_>| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("<non-string panic payload>");
        let location = info
            .location()
            .map(|loc| format!("{loc}"))
            .unwrap_or_else(|| "<unknown>".to_string());
        // Sync and refresh loops run on runtime workers; name the thread that died.
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");
        let backtrace = std::backtrace::Backtrace::force_capture();

        // Still runs the default hook when the logger is gone.
        log::error!(
            "panic: thread={thread} payload={payload} location={location}\nbacktrace:\n{backtrace}"
        );
        default_hook(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_prefers_app_variable() {
        assert_eq!(
            resolve_log_spec(Some("debug".to_string()), Some("trace".to_string())),
            "debug"
        );
        assert_eq!(
            resolve_log_spec(Some("  ".to_string()), Some("trace".to_string())),
            "trace"
        );
        assert_eq!(resolve_log_spec(None, None), default_log_spec());
        assert!(default_log_spec().contains("battle_plan_lib="));
    }
}
