use tracing::error;

/// Sends panics to the log file before the default report, so a crash
/// of a detached player task is not lost.
pub fn set_panic_hook() {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(location = location.as_str(), "panic: {panic_info}");
        hook(panic_info);
    }));
}
