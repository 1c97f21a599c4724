//! Firebase Realtime Database over its REST and streaming endpoints.

pub mod sink;
pub mod stream;

/// Where the database lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub database_url: String,
    pub auth_token: Option<String>,
}

impl FirebaseConfig {
    /// REST URL for a database path: `{db}/{path}.json[?auth=..]`.
    pub fn url_for(&self, path: &str) -> String {
        let base = self.database_url.trim_end_matches('/');
        let path = path.trim_matches('/');
        match &self.auth_token {
            Some(token) => format!("{base}/{path}.json?auth={token}"),
            None => format!("{base}/{path}.json"),
        }
    }
}
