/// Get environment variable with INKFLOW_ prefix, falling back to unprefixed version
///
/// Checks `INKFLOW_{key}` first, then `{key}`, so that standard names such as
/// `PORT` or `STRIPE_SECRET_KEY` work on hosted platforms.
///
/// # Examples
///
/// ```rust,ignore
/// use inkflow::utils::get_env_with_prefix;
///
/// // Checks INKFLOW_STRIPE_WEBHOOK_SECRET first, then STRIPE_WEBHOOK_SECRET
/// let secret = get_env_with_prefix("STRIPE_WEBHOOK_SECRET");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("INKFLOW_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Same as [`get_env_with_prefix`], parsed into `T`. Unparseable values are ignored.
pub fn get_env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|value| value.trim().parse().ok())
}
