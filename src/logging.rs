//! Tracing setup and log-safe masking helpers

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).init(),
    }
}

/// Keep the country code (when present) and the last three digits.
///
/// `+260971234567` becomes `+260******567`, `0971234567` becomes `*******567`.
pub fn mask_phone_number(phone: &str) -> String {
    let trimmed = phone.trim();
    let (prefix, rest) = match trimmed.strip_prefix('+') {
        Some(rest) if rest.is_ascii() && rest.len() > 6 => (format!("+{}", &rest[..3]), &rest[3..]),
        _ => (String::new(), trimmed),
    };

    let chars: Vec<char> = rest.chars().collect();
    if chars.len() <= 3 {
        return format!("{}{}", prefix, "*".repeat(chars.len()));
    }

    let visible: String = chars[chars.len() - 3..].iter().collect();
    format!("{}{}{}", prefix, "*".repeat(chars.len() - 3), visible)
}

/// Show only the first four characters of a credential.
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    let head: String = secret.chars().take(4).collect();
    format!("{}****", head)
}
