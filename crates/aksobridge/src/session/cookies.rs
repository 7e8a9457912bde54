//! Per-connection cookie jar.

use reqwest::Url;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use tokio::sync::mpsc;

/// Cookie store handed to the upstream client.
///
/// Behaves like a plain [`Jar`], and additionally queues every raw
/// `Set-Cookie` value so the connection can forward it to the client.
pub struct CookieRecorder {
    jar: Jar,
    queue: mpsc::UnboundedSender<String>,
}

impl CookieRecorder {
    pub fn new(queue: mpsc::UnboundedSender<String>) -> Self {
        Self {
            jar: Jar::default(),
            queue,
        }
    }

    /// Seed the jar with the client's existing cookies. These are not queued.
    pub fn seed(&self, cookies: &[(String, String)], url: &Url) {
        for (name, value) in cookies {
            self.jar.add_cookie_str(&format!("{name}={value}"), url);
        }
    }
}

impl CookieStore for CookieRecorder {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let headers: Vec<&HeaderValue> = cookie_headers.collect();
        for header in &headers {
            match header.to_str() {
                Ok(raw) => {
                    // receiver gone means the connection already ended
                    let _ = self.queue.send(raw.to_string());
                }
                Err(_) => tracing::warn!("Dropping non-ASCII Set-Cookie header"),
            }
        }
        self.jar.set_cookies(&mut headers.into_iter(), url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.jar.cookies(url)
    }
}
