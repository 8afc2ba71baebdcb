//! File-backed collaborators for the requester.
//!
//! Files are read again on every call so that edits take effect on the next
//! pool refresh.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rotary_lib::{
    CookieProvider, ErrorKind, MetricsSink, Outcome, ProxySource, Result, ThrottleKey, UserAgent,
    UserAgentSource,
};
use url::Url;

async fn read_lines(name: &'static str, path: &Path) -> Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| unavailable(name, format!("can't read `{}`: {e}", path.display())))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

fn unavailable(name: &'static str, reason: String) -> ErrorKind {
    ErrorKind::CollaboratorUnavailable { name, reason }
}

/// Cookie strings, one per line, handed out to the identities in turn
#[derive(Debug, Clone)]
pub(crate) struct CookieFile(pub(crate) PathBuf);

#[async_trait]
impl CookieProvider for CookieFile {
    async fn cookies(&self, n: usize) -> Result<Vec<String>> {
        let lines = read_lines("cookie file", &self.0).await?;
        if lines.is_empty() {
            return Ok(vec![String::new(); n]);
        }
        Ok(lines.into_iter().cycle().take(n).collect())
    }
}

/// Proxy URLs, one per line
#[derive(Debug, Clone)]
pub(crate) struct ProxyFile(pub(crate) PathBuf);

#[async_trait]
impl ProxySource for ProxyFile {
    async fn proxies(&self) -> Result<Vec<Url>> {
        read_lines("proxy file", &self.0)
            .await?
            .iter()
            .map(|line| {
                Url::parse(line).map_err(|e| unavailable("proxy file", format!("`{line}`: {e}")))
            })
            .collect()
    }
}

/// User-agent records as a JSON array
#[derive(Debug, Clone)]
pub(crate) struct UserAgentFile(pub(crate) Option<PathBuf>);

#[async_trait]
impl UserAgentSource for UserAgentFile {
    async fn fetch(&self) -> Result<Vec<UserAgent>> {
        let Some(path) = &self.0 else {
            return Err(unavailable(
                "user agent file",
                "user agents are enabled but `--user-agents` was not given".to_string(),
            ));
        };
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            unavailable("user agent file", format!("can't read `{}`: {e}", path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| unavailable("user agent file", format!("invalid JSON: {e}")))
    }
}

/// Writes every measurement to the debug log
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record_request(&self, client: usize, host: &str, outcome: Outcome, elapsed: Duration) {
        debug!("[metrics] request client={client} host={host} outcome={outcome:?} elapsed={elapsed:?}");
    }

    fn set_throttle_rps(&self, key: &ThrottleKey, rps: u32) {
        debug!("[metrics] throttle {key} rps={rps}");
    }

    fn set_throttle_queue(&self, key: &ThrottleKey, pending: usize) {
        debug!("[metrics] throttle {key} pending={pending}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[tokio::test]
    async fn test_cookie_file_cycles_lines() {
        let file = file("a=1\n\n# comment\nb=2\n");
        let cookies = CookieFile(file.path().to_path_buf()).cookies(3).await.unwrap();
        assert_eq!(cookies, vec!["a=1", "b=2", "a=1"]);
    }

    #[tokio::test]
    async fn test_empty_cookie_file() {
        let file = file("");
        let cookies = CookieFile(file.path().to_path_buf()).cookies(2).await.unwrap();
        assert_eq!(cookies, vec!["", ""]);
    }

    #[tokio::test]
    async fn test_proxy_file() {
        let file = file("http://10.0.0.1:8080\nsocks5://10.0.0.2:1080\n");
        let proxies = ProxyFile(file.path().to_path_buf()).proxies().await.unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1].scheme(), "socks5");
    }

    #[tokio::test]
    async fn test_invalid_proxy_line() {
        let file = file("not a url\n");
        let err = ProxyFile(file.path().to_path_buf()).proxies().await.unwrap_err();
        assert!(matches!(err, ErrorKind::CollaboratorUnavailable { name: "proxy file", .. }));
    }

    #[tokio::test]
    async fn test_missing_user_agent_file() {
        let err = UserAgentFile(None).fetch().await.unwrap_err();
        assert!(matches!(err, ErrorKind::CollaboratorUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_user_agent_file() {
        let file = file(r#"[{"userAgent": "Mozilla/5.0", "timeSeen": 2000, "hardwareType": "computer"}]"#);
        let agents = UserAgentFile(Some(file.path().to_path_buf())).fetch().await.unwrap();
        assert_eq!(agents[0].user_agent, "Mozilla/5.0");
    }
}
