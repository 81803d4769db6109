use base64::Engine;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The item currently loaded into a backend. Only the id is meaningful to
/// the playback core; everything else rides along for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
}

impl Track {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            artist: None,
        }
    }
}

/// A resolved, playable location for a track.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackSource {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Set when the resolver already knows the source is a segmented stream.
    #[serde(default)]
    pub hls: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceLocation {
    Local(PathBuf),
    Remote(Url),
}

impl TrackSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.url.trim().is_empty()
    }

    pub fn is_segmented(&self) -> bool {
        if let Some(hint) = self.hls {
            return hint;
        }
        let path = match Url::parse(&self.url) {
            Ok(url) => url.path().to_ascii_lowercase(),
            Err(_) => self.url.to_ascii_lowercase(),
        };
        path.ends_with(".m3u8")
    }

    pub fn location(&self) -> SourceLocation {
        match Url::parse(&self.url) {
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => SourceLocation::Local(path),
                Err(_) => SourceLocation::Local(PathBuf::from(url.path())),
            },
            Ok(url) if matches!(url.scheme(), "http" | "https") => SourceLocation::Remote(url),
            _ => SourceLocation::Local(PathBuf::from(&self.url)),
        }
    }

    /// Moves credentials embedded in the URL into an explicit
    /// `Authorization` header. Returns `None` when the URL carries none.
    pub fn split_credentials(&self) -> Option<TrackSource> {
        let mut url = Url::parse(&self.url).ok()?;
        if url.username().is_empty() && url.password().is_none() {
            return None;
        }

        let user = percent_decode(url.username());
        let password = url.password().map(percent_decode).unwrap_or_default();
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));

        url.set_username("").ok()?;
        url.set_password(None).ok()?;

        let mut rewritten = self.clone();
        rewritten.url = url.to_string();
        rewritten
            .headers
            .insert("Authorization".to_string(), format!("Basic {token}"));
        Some(rewritten)
    }
}

fn percent_decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
