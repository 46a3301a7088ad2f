use std::env;
use std::str::FromStr;
use tracing::warn;

/// Which realtime document store backs the chat cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatBackend {
    Memory,
    Redis,
}

impl FromStr for ChatBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(ChatBackend::Memory),
            "redis" => Ok(ChatBackend::Redis),
            other => Err(format!("unknown chat backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub chat_backend: ChatBackend,
    pub chat_send_max_attempts: u32,
    pub chat_send_backoff_ms: u64,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            redis_url: None,
            chat_backend: ChatBackend::Memory,
            chat_send_max_attempts: 2,
            chat_send_backoff_ms: 250,
            port: 3000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            chat_backend: parse_var("CHAT_BACKEND", defaults.chat_backend),
            chat_send_max_attempts: parse_var("CHAT_SEND_MAX_ATTEMPTS", defaults.chat_send_max_attempts),
            chat_send_backoff_ms: parse_var("CHAT_SEND_BACKOFF_MS", defaults.chat_send_backoff_ms),
            port: parse_var("PORT", defaults.port),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        if config.chat_backend == ChatBackend::Redis && config.redis_url.is_none() {
            warn!("CHAT_BACKEND=redis but REDIS_URL not set, falling back to redis://localhost:6379");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Identity mappings live in Supabase only when it is reachable.
    pub fn is_identity_store_remote(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn redis_url_or_default(&self) -> String {
        self.redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string())
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {:?}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_backend_parsing() {
        assert_eq!("memory".parse::<ChatBackend>(), Ok(ChatBackend::Memory));
        assert_eq!(" Redis ".parse::<ChatBackend>(), Ok(ChatBackend::Redis));
        assert!("firebase".parse::<ChatBackend>().is_err());
    }

    #[test]
    fn test_default_config_is_not_configured() {
        let config = AppConfig::default();
        assert!(!config.is_configured());
        assert!(!config.is_identity_store_remote());
        assert_eq!(config.chat_backend, ChatBackend::Memory);
        assert_eq!(config.redis_url_or_default(), "redis://localhost:6379");
    }
}
