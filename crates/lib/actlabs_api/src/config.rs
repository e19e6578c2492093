//! API server configuration.

/// Origins allowed when `ALLOWED_ORIGINS` is unset.
pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "https://ashisverma.z13.web.core.windows.net",
    "https://actlabs.z13.web.core.windows.net",
    "https://actlabsbeta.z13.web.core.windows.net",
    "https://actlabs.azureedge.net",
    "https://*.azurewebsites.net",
];

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "0.0.0.0:8883").
    pub bind_addr: String,
    /// CORS origins; a leading `*.` in the host matches any subdomain.
    pub allowed_origins: Vec<String>,
    /// Take the client IP from the first `X-Forwarded-For` entry.
    pub trust_forwarded_for: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8883".into(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
            trust_forwarded_for: false,
        }
    }
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable              | Default                      |
    /// |-----------------------|------------------------------|
    /// | `BIND_ADDR`           | `0.0.0.0:$PORT`              |
    /// | `PORT`                | `8883`                       |
    /// | `ALLOWED_ORIGINS`     | [`DEFAULT_ALLOWED_ORIGINS`]  |
    /// | `TRUST_FORWARDED_FOR` | `false`                      |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = std::env::var("PORT").unwrap_or_else(|_| "8883".into());
        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| format!("0.0.0.0:{port}")),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|v| parse_origins(&v))
                .unwrap_or(defaults.allowed_origins),
            trust_forwarded_for: std::env::var("TRUST_FORWARDED_FOR")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

/// Split a comma separated origin list, dropping blanks and trailing slashes.
pub fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether `origin` matches one of `allowed`.
pub fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed.iter().any(|pattern| origin_matches(pattern, origin))
}

fn origin_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" || pattern == origin {
        return true;
    }
    let Some((scheme, host)) = pattern.split_once("://*.") else {
        return false;
    };
    origin
        .strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix("://"))
        .and_then(|rest| rest.strip_suffix(host))
        .and_then(|sub| sub.strip_suffix('.'))
        .is_some_and(|sub| !sub.is_empty() && !sub.contains('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_trimmed() {
        assert_eq!(
            parse_origins(" http://localhost:3000/ ,, https://a.example"),
            vec!["http://localhost:3000", "https://a.example"]
        );
    }

    #[test]
    fn exact_and_wildcard_origins_match() {
        let allowed = parse_origins("http://localhost:5173,https://*.azurewebsites.net");
        assert!(origin_allowed(&allowed, "http://localhost:5173"));
        assert!(origin_allowed(&allowed, "https://actlabs.azurewebsites.net"));
        assert!(origin_allowed(&allowed, "https://a.b.azurewebsites.net"));
        assert!(!origin_allowed(&allowed, "https://azurewebsites.net"));
        assert!(!origin_allowed(&allowed, "http://actlabs.azurewebsites.net"));
        assert!(!origin_allowed(&allowed, "https://evilazurewebsites.net"));
        assert!(!origin_allowed(&allowed, "http://localhost:3000"));
    }
}
