//! Authentication challenges and the credential store collaborator.
//!
//! The client only knows how to read `WWW-Authenticate` challenges and attach an
//! `Authorization` header. Deciding which credentials answer a challenge, and learning
//! where they apply, is the job of a [`CredentialStore`]. [`BasicCredentials`] is a small
//! in-memory store for HTTP Basic authentication.

use std::fmt;

use http::header::{self, HeaderMap, HeaderValue};
use http::Uri;

use super::pool::Target;

/// One challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    scheme: String,
    params: Vec<(String, String)>,
}

impl Challenge {
    /// The authentication scheme, lower cased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The value of a parameter. Parameter names are matched case-insensitively.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The protection space named by the server.
    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    /// All challenges in the `WWW-Authenticate` headers of a response.
    pub fn from_headers(headers: &HeaderMap) -> Vec<Challenge> {
        headers
            .get_all(header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_challenges)
            .collect()
    }
}

enum Item {
    Token(String),
    Param(String, String),
}

fn parse_challenges(value: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();
    for item in items(value) {
        match item {
            Item::Token(scheme) => challenges.push(Challenge {
                scheme: scheme.to_ascii_lowercase(),
                params: Vec::new(),
            }),
            Item::Param(key, value) => {
                if let Some(challenge) = challenges.last_mut() {
                    challenge.params.push((key, value));
                }
            }
        }
    }
    challenges
}

/// Split a challenge list into scheme tokens and `name=value` parameters.
fn items(value: &str) -> Vec<Item> {
    let mut items = Vec::new();
    let mut rest = value.trim_start();
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| c == ' ' || c == ',' || c == '=' || c == '\t')
            .unwrap_or(rest.len());
        let word = &rest[..end];
        rest = rest[end..].trim_start_matches([' ', '\t']);

        if let Some(after) = rest.strip_prefix('=') {
            let after = after.trim_start_matches([' ', '\t']);
            let (value, remainder) = match after.strip_prefix('"') {
                Some(quoted) => quoted_string(quoted),
                None => {
                    let end = after.find([',', ' ', '\t']).unwrap_or(after.len());
                    (after[..end].to_owned(), &after[end..])
                }
            };
            items.push(Item::Param(word.to_owned(), value));
            rest = remainder;
        } else if !word.is_empty() {
            items.push(Item::Token(word.to_owned()));
        }
        rest = rest.trim_start_matches([' ', '\t', ',']);
    }
    items
}

fn quoted_string(input: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            '"' => return (value, &input[i + 1..]),
            c => value.push(c),
        }
    }
    (value, "")
}

fn base64(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut encoded = String::with_capacity(data.len().div_ceil(3) * 4);
    for group in data.chunks(3) {
        let bits = group
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, byte)| acc | u32::from(*byte) << (16 - 8 * i));
        for i in 0..4 {
            if i <= group.len() {
                encoded.push(ALPHABET[(bits >> (18 - 6 * i) & 0x3F) as usize] as char);
            } else {
                encoded.push('=');
            }
        }
    }
    encoded
}

/// Credentials for one server, optionally limited to one realm.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    origin: Target,
    realm: Option<String>,
    user: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("origin", &self.origin)
            .field("realm", &self.realm)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Basic credentials for `origin`.
    pub fn basic(origin: Target, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            origin,
            realm: None,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Only answer challenges for `realm`.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// The server these credentials belong to.
    pub fn origin(&self) -> &Target {
        &self.origin
    }

    /// The user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The value of an `Authorization` header carrying these credentials.
    pub fn authorization(&self) -> HeaderValue {
        let token = base64(format!("{}:{}", self.user, self.password).as_bytes());
        let mut value = HeaderValue::from_str(&format!("Basic {token}"))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        value.set_sensitive(true);
        value
    }

    fn answers(&self, challenge: &Challenge, target: &Target) -> bool {
        challenge.scheme() == "basic"
            && &self.origin == target
            && match (&self.realm, challenge.realm()) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => true,
            }
    }
}

/// The credential store collaborator.
///
/// The client asks the store for credentials when a request is admitted (`find_for_url`)
/// and when a response carries a challenge (`find_for_challenge`), then reports whether
/// the credentials it tried were accepted.
pub trait CredentialStore: Send + 'static {
    /// Credentials which may answer `challenge` for a request to `uri`.
    fn find_for_challenge(&self, challenge: &Challenge, uri: &Uri) -> Vec<Credentials>;

    /// Credentials known to be needed for `uri`, sent without waiting for a challenge.
    fn find_for_url(&self, uri: &Uri) -> Option<Credentials>;

    /// The credentials were rejected.
    fn forget(&mut self, credentials: &Credentials);

    /// The credentials were accepted for `uri`.
    fn success(&mut self, credentials: &Credentials, uri: &Uri);
}

#[derive(Debug, Clone)]
struct Entry {
    credentials: Credentials,
    scopes: Vec<String>,
}

/// An in-memory store of Basic credentials.
///
/// Paths where credentials were accepted are remembered, and later requests below the
/// same directory send them preemptively.
#[derive(Debug, Clone, Default)]
pub struct BasicCredentials {
    entries: Vec<Entry>,
}

impl BasicCredentials {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add credentials to the store.
    pub fn add(&mut self, credentials: Credentials) {
        self.entries.push(Entry {
            credentials,
            scopes: Vec::new(),
        });
    }

    /// Add credentials, builder style.
    pub fn with(mut self, credentials: Credentials) -> Self {
        self.add(credentials);
        self
    }

    /// The number of credentials held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn directory(uri: &Uri) -> String {
    let path = uri.path();
    match path.rfind('/') {
        Some(at) => path[..=at].to_owned(),
        None => "/".to_owned(),
    }
}

impl CredentialStore for BasicCredentials {
    fn find_for_challenge(&self, challenge: &Challenge, uri: &Uri) -> Vec<Credentials> {
        let Ok(target) = Target::try_from(uri) else {
            return Vec::new();
        };
        self.entries
            .iter()
            .filter(|entry| entry.credentials.answers(challenge, &target))
            .map(|entry| entry.credentials.clone())
            .collect()
    }

    fn find_for_url(&self, uri: &Uri) -> Option<Credentials> {
        let target = Target::try_from(uri).ok()?;
        self.entries
            .iter()
            .filter(|entry| entry.credentials.origin == target)
            .find(|entry| entry.scopes.iter().any(|scope| uri.path().starts_with(scope.as_str())))
            .map(|entry| entry.credentials.clone())
    }

    fn forget(&mut self, credentials: &Credentials) {
        self.entries.retain(|entry| &entry.credentials != credentials);
    }

    fn success(&mut self, credentials: &Credentials, uri: &Uri) {
        let scope = directory(uri);
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| &entry.credentials == credentials)
        {
            if !entry.scopes.contains(&scope) {
                entry.scopes.push(scope);
            }
        }
    }
}
