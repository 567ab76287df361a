use tokio::sync::Mutex as AsyncMutex;

/// Serializes tests that touch process environment variables.
/// Sync tests take it with `.blocking_lock()`, async tests with `.lock().await`.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

pub const QUILL_ENV_KEYS: [&str; 8] = [
    "QUILL_API_URL",
    "QUILL_API_TOKEN",
    "QUILL_USER_ID",
    "QUILL_MODEL",
    "QUILL_PAGE_SIZE",
    "QUILL_REFETCH_DELAY_MS",
    "QUILL_META_START",
    "QUILL_META_END",
];

/// Removes every configuration variable so `Config::load` sees defaults.
/// Hold `ENV_LOCK` while calling.
pub fn clear_quill_env() {
    for key in QUILL_ENV_KEYS {
        std::env::remove_var(key);
    }
}
