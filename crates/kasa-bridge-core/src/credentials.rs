//! Credentials for KLAP authentication.
//!
//! Devices on newer firmware authenticate the KLAP handshake against a hash
//! of the owner's TP-Link account credentials. Devices that were never bound
//! to a cloud account accept blank credentials, and some accept one of the
//! well-known default accounts instead. [`Credentials::candidates`] yields
//! them in the order the handshake checks them.
//!
//! Passwords are held in a [`SecretString`] so they never end up in logs.

use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// Username/password pair used to derive KLAP authentication hashes.
///
/// # Example
///
/// ```
/// use kasa_bridge_core::Credentials;
///
/// let creds = Credentials::new("user@example.com", "password123");
/// assert_eq!(creds.username, "user@example.com");
/// assert!(!creds.is_blank());
/// ```
#[derive(Clone)]
pub struct Credentials {
    /// The username (an email address for TP-Link accounts).
    pub username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials from a username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Builds credentials only when both parts are non-empty.
    ///
    /// A half-configured pair (email without password or the reverse) is
    /// treated as no credentials at all.
    ///
    /// ```
    /// use kasa_bridge_core::Credentials;
    ///
    /// assert!(Credentials::from_parts("user@example.com", "pw").is_some());
    /// assert!(Credentials::from_parts("user@example.com", "").is_none());
    /// ```
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            None
        } else {
            Some(Self::new(username, password))
        }
    }

    /// Creates blank credentials (empty username and password).
    pub fn blank() -> Self {
        Self::new(String::new(), String::new())
    }

    /// Returns `true` if both username and password are empty.
    pub fn is_blank(&self) -> bool {
        self.username.is_empty() && self.password.expose_secret().is_empty()
    }

    /// Exposes the password for hashing. Never log the returned value.
    pub fn expose_password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Credential sets to try during a KLAP handshake, labelled for logging.
    ///
    /// Order: the supplied credentials (if any), the default accounts, then
    /// blank credentials unless the supplied ones were already blank.
    pub fn candidates(user: Option<&Credentials>) -> Vec<(&'static str, Credentials)> {
        let mut sets = Vec::with_capacity(4);
        if let Some(creds) = user {
            sets.push(("user", creds.clone()));
        }
        for default in DefaultCredentials::all() {
            sets.push((default.label(), default.credentials()));
        }
        if user.is_none_or(|c| !c.is_blank()) {
            sets.push(("blank", Credentials::blank()));
        }
        sets
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::blank()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl Eq for Credentials {}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Well-known accounts some devices accept in place of the owner's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultCredentials {
    /// Default Kasa account.
    Kasa,
    /// Default Tapo account.
    Tapo,
}

impl DefaultCredentials {
    /// Returns the credentials for this default account.
    pub fn credentials(self) -> Credentials {
        match self {
            DefaultCredentials::Kasa => Credentials::new("kasa@tp-link.net", "kasaSetup"),
            DefaultCredentials::Tapo => Credentials::new("test@tp-link.net", "test"),
        }
    }

    /// Returns all default accounts in handshake order.
    pub fn all() -> &'static [DefaultCredentials] {
        &[DefaultCredentials::Kasa, DefaultCredentials::Tapo]
    }

    fn label(self) -> &'static str {
        match self {
            DefaultCredentials::Kasa => "kasa default",
            DefaultCredentials::Tapo => "tapo default",
        }
    }
}
