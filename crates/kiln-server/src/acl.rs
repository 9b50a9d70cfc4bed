//! Users, passwords, and per-connection authorization.
//!
//! Every connection is registered against a user (the `default` user
//! at first) and every dispatched command is checked against that
//! user's category, command, key, and channel rules. Inclusion lists
//! support glob patterns; a bare `*` means "all". The `default` user
//! always exists and cannot be removed.
//!
//! Passwords are stored either plaintext or as hex SHA-256 digests;
//! both are compared in constant time.

use std::fs;
use std::path::Path;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;

use crate::error::CommandError;
use crate::glob::glob_match;

/// Errors raised while loading the ACL configuration.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("failed to read acl config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse acl config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("acl config error: {0}")]
    Invalid(String),
}

/// How a stored password value is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PasswordKind {
    Plaintext,
    Sha256,
}

/// One credential on a user.
#[derive(Debug, Clone, Deserialize)]
pub struct Password {
    #[serde(rename = "type")]
    pub kind: PasswordKind,
    pub value: String,
}

impl Password {
    /// Infers the encoding the way the config loader does: values
    /// prefixed with `#` are hex SHA-256 digests.
    pub fn infer(raw: &str) -> Self {
        if let Some(digest) = raw.strip_prefix('#') {
            Password {
                kind: PasswordKind::Sha256,
                value: digest.to_string(),
            }
        } else {
            Password {
                kind: PasswordKind::Plaintext,
                value: raw.to_string(),
            }
        }
    }

    fn matches(&self, provided: &[u8]) -> bool {
        match self.kind {
            PasswordKind::Plaintext => {
                bool::from(self.value.as_bytes().ct_eq(provided))
            }
            PasswordKind::Sha256 => {
                let digest = Sha256::digest(provided);
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                bool::from(hex.as_bytes().ct_eq(self.value.to_ascii_lowercase().as_bytes()))
            }
        }
    }
}

/// One ACL user record. Inclusion lists default to the `*` wildcard;
/// exclusion lists default to empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    pub enabled: bool,
    pub passwords: Vec<Password>,

    pub included_categories: Vec<String>,
    pub excluded_categories: Vec<String>,

    pub included_commands: Vec<String>,
    pub excluded_commands: Vec<String>,

    pub included_keys: Vec<String>,
    pub excluded_keys: Vec<String>,
    pub included_read_keys: Vec<String>,
    pub included_write_keys: Vec<String>,

    pub included_channels: Vec<String>,
    pub excluded_channels: Vec<String>,
}

impl Default for User {
    fn default() -> Self {
        Self {
            username: String::new(),
            enabled: true,
            passwords: Vec::new(),
            included_categories: vec!["*".into()],
            excluded_categories: Vec::new(),
            included_commands: vec!["*".into()],
            excluded_commands: Vec::new(),
            included_keys: vec!["*".into()],
            excluded_keys: Vec::new(),
            included_read_keys: vec!["*".into()],
            included_write_keys: vec!["*".into()],
            included_channels: vec!["*".into()],
            excluded_channels: Vec::new(),
        }
    }
}

impl User {
    /// A fully-permissive user with the given name.
    pub fn permissive(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Self::default()
        }
    }

    /// Whether the user authenticates without a password.
    fn no_password(&self) -> bool {
        self.passwords.is_empty()
    }
}

/// Pattern-list membership: `*` admits everything, otherwise any glob
/// in the list must match.
fn list_admits(list: &[String], item: &str) -> bool {
    list.iter()
        .any(|pat| pat == "*" || glob_match(pat, item))
}

/// Exact (case-insensitive) membership for command/category exclusions.
fn list_names(list: &[String], item: &str) -> bool {
    list.iter().any(|n| n.eq_ignore_ascii_case(item))
}

struct ConnAuth {
    username: String,
    authenticated: bool,
}

/// The access-control layer: user records plus per-connection
/// authentication state.
pub struct Acl {
    users: RwLock<Vec<User>>,
    connections: DashMap<u64, ConnAuth>,
    require_pass: bool,
}

impl Acl {
    /// Builds the ACL: the mandatory `default` user (carrying the
    /// server password when `require_pass` is set), overlaid with
    /// users from the optional JSON config file.
    pub fn load(
        require_pass: bool,
        password: Option<&str>,
        acl_config: Option<&Path>,
    ) -> Result<Self, AclError> {
        let mut default_user = User::permissive("default");
        if require_pass {
            let raw = password.ok_or_else(|| {
                AclError::Invalid("--require-pass is set but no password was provided".into())
            })?;
            default_user.passwords.push(Password::infer(raw));
        }

        let mut users = vec![default_user];

        if let Some(path) = acl_config {
            let contents = fs::read_to_string(path)?;
            let loaded: Vec<User> = serde_json::from_str(&contents)?;
            for user in loaded {
                if user.username.is_empty() {
                    return Err(AclError::Invalid("user record without a username".into()));
                }
                if user.username == "default" {
                    // config may reshape the default user, but it must
                    // stay present; merge passwords with the server's
                    let mut merged = user;
                    merged.passwords.extend(users[0].passwords.clone());
                    users[0] = merged;
                } else {
                    users.push(user);
                }
            }
            info!(users = users.len(), "loaded acl config");
        }

        Ok(Self {
            users: RwLock::new(users),
            connections: DashMap::new(),
            require_pass,
        })
    }

    /// A permissive ACL for servers without authentication.
    pub fn open() -> Self {
        Self {
            users: RwLock::new(vec![User::permissive("default")]),
            connections: DashMap::new(),
            require_pass: false,
        }
    }

    /// Associates a new connection with the default user. The
    /// connection starts authenticated iff the default user has no
    /// password.
    pub fn register_connection(&self, conn_id: u64) {
        let no_password = self
            .users
            .read()
            .iter()
            .find(|u| u.username == "default")
            .map(|u| u.no_password())
            .unwrap_or(false);
        self.connections.insert(
            conn_id,
            ConnAuth {
                username: "default".into(),
                authenticated: no_password,
            },
        );
    }

    /// Drops a closed connection's auth state.
    pub fn remove_connection(&self, conn_id: u64) {
        self.connections.remove(&conn_id);
    }

    /// Handles AUTH: `AUTH password` authenticates against the default
    /// user, `AUTH username password` against the named user. Both the
    /// plaintext and the SHA-256 form of each stored password are
    /// accepted.
    pub fn authenticate(&self, conn_id: u64, args: &[Bytes]) -> Result<(), CommandError> {
        let (username, provided): (String, &Bytes) = match args {
            [password] => ("default".into(), password),
            [username, password] => (
                String::from_utf8_lossy(username).into_owned(),
                password,
            ),
            _ => return Err(CommandError::WrongArity("auth")),
        };

        let users = self.users.read();
        let user = users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(|| CommandError::Unauthorized("invalid username or password".into()))?;

        if !user.enabled {
            return Err(CommandError::Unauthorized("user is disabled".into()));
        }
        if !user.no_password() && !user.passwords.iter().any(|p| p.matches(provided)) {
            return Err(CommandError::Unauthorized(
                "invalid username or password".into(),
            ));
        }

        drop(users);
        self.connections.insert(
            conn_id,
            ConnAuth {
                username,
                authenticated: true,
            },
        );
        Ok(())
    }

    /// Authorizes one command dispatch for a connection. Checks, in
    /// order: authentication (when the server requires a password),
    /// category rules, command rules, key rules (read/write lists on
    /// top of the general list), and channel rules.
    pub fn authorize(
        &self,
        conn_id: u64,
        command: &str,
        categories: &[&str],
        read_keys: &[String],
        write_keys: &[String],
        channels: &[String],
    ) -> Result<(), CommandError> {
        let conn = self.connections.get(&conn_id);
        let (username, authenticated) = match conn.as_ref() {
            Some(auth) => (auth.username.clone(), auth.authenticated),
            None => ("default".to_string(), !self.require_pass),
        };

        if self.require_pass && !authenticated {
            return Err(CommandError::Unauthorized("Authentication required.".into()));
        }

        let users = self.users.read();
        let user = users
            .iter()
            .find(|u| u.username == username)
            .ok_or_else(|| CommandError::Unauthorized("unknown user".into()))?;

        if !user.enabled {
            return Err(CommandError::Unauthorized("user is disabled".into()));
        }

        for category in categories {
            if !list_names(&user.included_categories, category)
                && !user.included_categories.iter().any(|c| c == "*")
            {
                return Err(CommandError::Unauthorized(format!(
                    "user lacks the '{category}' category"
                )));
            }
            if list_names(&user.excluded_categories, category) {
                return Err(CommandError::Unauthorized(format!(
                    "category '{category}' is denied for this user"
                )));
            }
        }

        if !user.included_commands.iter().any(|c| c == "*")
            && !list_names(&user.included_commands, command)
        {
            return Err(CommandError::Unauthorized(format!(
                "command '{}' is not allowed for this user",
                command.to_lowercase()
            )));
        }
        if list_names(&user.excluded_commands, command) {
            return Err(CommandError::Unauthorized(format!(
                "command '{}' is denied for this user",
                command.to_lowercase()
            )));
        }

        let has_read = categories.iter().any(|c| *c == "read");
        let has_write = categories.iter().any(|c| *c == "write");

        for key in read_keys.iter().chain(write_keys.iter()) {
            if !list_admits(&user.included_keys, key) {
                return Err(CommandError::Unauthorized(format!(
                    "key '{key}' is not allowed for this user"
                )));
            }
            if user.excluded_keys.iter().any(|pat| glob_match(pat, key)) {
                return Err(CommandError::Unauthorized(format!(
                    "key '{key}' is denied for this user"
                )));
            }
        }
        if has_read {
            for key in read_keys {
                if !list_admits(&user.included_read_keys, key) {
                    return Err(CommandError::Unauthorized(format!(
                        "no read permission for key '{key}'"
                    )));
                }
            }
        }
        if has_write {
            for key in write_keys {
                if !list_admits(&user.included_write_keys, key) {
                    return Err(CommandError::Unauthorized(format!(
                        "no write permission for key '{key}'"
                    )));
                }
            }
        }

        for channel in channels {
            if !list_admits(&user.included_channels, channel) {
                return Err(CommandError::Unauthorized(format!(
                    "channel '{channel}' is not allowed for this user"
                )));
            }
            if user
                .excluded_channels
                .iter()
                .any(|pat| glob_match(pat, channel))
            {
                return Err(CommandError::Unauthorized(format!(
                    "channel '{channel}' is denied for this user"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn open_acl_with_user(user: User) -> Acl {
        let acl = Acl::open();
        acl.users.write().push(user);
        acl
    }

    #[test]
    fn register_without_password_is_authenticated() {
        let acl = Acl::open();
        acl.register_connection(1);
        assert!(acl.authorize(1, "GET", &["read"], &["k".into()], &[], &[]).is_ok());
    }

    #[test]
    fn require_pass_blocks_until_auth() {
        let acl = Acl::load(true, Some("hunter2"), None).unwrap();
        acl.register_connection(1);

        let err = acl
            .authorize(1, "GET", &["read"], &["k".into()], &[], &[])
            .unwrap_err();
        assert!(matches!(err, CommandError::Unauthorized(_)));

        acl.authenticate(1, &[Bytes::from("hunter2")]).unwrap();
        assert!(acl.authorize(1, "GET", &["read"], &["k".into()], &[], &[]).is_ok());
    }

    #[test]
    fn wrong_password_rejected() {
        let acl = Acl::load(true, Some("hunter2"), None).unwrap();
        acl.register_connection(1);
        let err = acl.authenticate(1, &[Bytes::from("wrong")]).unwrap_err();
        assert!(matches!(err, CommandError::Unauthorized(_)));
    }

    #[test]
    fn sha256_password_accepted() {
        // sha256("secret")
        let digest = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b";
        let acl = Acl::load(true, Some(&format!("#{digest}")), None).unwrap();
        acl.register_connection(1);
        acl.authenticate(1, &[Bytes::from("secret")]).unwrap();
    }

    #[test]
    fn named_user_authentication() {
        let mut user = User::permissive("reporter");
        user.passwords.push(Password::infer("scoop"));
        let acl = open_acl_with_user(user);
        acl.register_connection(7);

        acl.authenticate(7, &[Bytes::from("reporter"), Bytes::from("scoop")])
            .unwrap();
        let err = acl
            .authenticate(7, &[Bytes::from("reporter"), Bytes::from("nope")])
            .unwrap_err();
        assert!(matches!(err, CommandError::Unauthorized(_)));
    }

    #[test]
    fn disabled_user_rejected() {
        let mut user = User::permissive("ghost");
        user.enabled = false;
        user.passwords.push(Password::infer("boo"));
        let acl = open_acl_with_user(user);
        acl.register_connection(3);

        let err = acl
            .authenticate(3, &[Bytes::from("ghost"), Bytes::from("boo")])
            .unwrap_err();
        assert!(matches!(err, CommandError::Unauthorized(_)));
    }

    #[test]
    fn excluded_command_denied() {
        let mut user = User::permissive("limited");
        user.excluded_commands.push("del".into());
        let acl = open_acl_with_user(user);
        acl.register_connection(2);
        acl.connections.insert(
            2,
            ConnAuth {
                username: "limited".into(),
                authenticated: true,
            },
        );

        let err = acl
            .authorize(2, "DEL", &["write"], &[], &["k".into()], &[])
            .unwrap_err();
        assert!(matches!(err, CommandError::Unauthorized(_)));
        assert!(acl.authorize(2, "GET", &["read"], &["k".into()], &[], &[]).is_ok());
    }

    #[test]
    fn excluded_category_denied() {
        let mut user = User::permissive("reader");
        user.excluded_categories.push("write".into());
        let acl = open_acl_with_user(user);
        acl.connections.insert(
            4,
            ConnAuth {
                username: "reader".into(),
                authenticated: true,
            },
        );

        let err = acl
            .authorize(4, "SET", &["write"], &[], &["k".into()], &[])
            .unwrap_err();
        assert!(matches!(err, CommandError::Unauthorized(_)));
    }

    #[test]
    fn key_patterns_enforced() {
        let mut user = User::permissive("app");
        user.included_keys = vec!["app:*".into()];
        user.included_write_keys = vec!["app:rw:*".into()];
        let acl = open_acl_with_user(user);
        acl.connections.insert(
            5,
            ConnAuth {
                username: "app".into(),
                authenticated: true,
            },
        );

        // read inside the namespace: allowed
        assert!(acl
            .authorize(5, "GET", &["read"], &["app:config".into()], &[], &[])
            .is_ok());
        // read outside: denied
        assert!(acl
            .authorize(5, "GET", &["read"], &["other".into()], &[], &[])
            .is_err());
        // write outside the write namespace: denied
        assert!(acl
            .authorize(5, "SET", &["write"], &[], &["app:config".into()], &[])
            .is_err());
        // write inside it: allowed
        assert!(acl
            .authorize(5, "SET", &["write"], &[], &["app:rw:state".into()], &[])
            .is_ok());
    }

    #[test]
    fn channel_patterns_enforced() {
        let mut user = User::permissive("sub");
        user.included_channels = vec!["news.*".into()];
        user.excluded_channels = vec!["news.secret".into()];
        let acl = open_acl_with_user(user);
        acl.connections.insert(
            6,
            ConnAuth {
                username: "sub".into(),
                authenticated: true,
            },
        );

        assert!(acl
            .authorize(6, "SUBSCRIBE", &["pubsub"], &[], &[], &["news.sports".into()])
            .is_ok());
        assert!(acl
            .authorize(6, "SUBSCRIBE", &["pubsub"], &[], &[], &["chat".into()])
            .is_err());
        assert!(acl
            .authorize(6, "SUBSCRIBE", &["pubsub"], &[], &[], &["news.secret".into()])
            .is_err());
    }

    #[test]
    fn loads_users_from_json_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{
                    "username": "metrics",
                    "passwords": [{{"type": "plaintext", "value": "graph"}}],
                    "included_keys": ["metrics:*"],
                    "excluded_commands": ["del"]
                }}
            ]"#
        )
        .unwrap();

        let acl = Acl::load(false, None, Some(file.path())).unwrap();
        acl.register_connection(9);
        acl.authenticate(9, &[Bytes::from("metrics"), Bytes::from("graph")])
            .unwrap();
        assert!(acl
            .authorize(9, "GET", &["read"], &["metrics:cpu".into()], &[], &[])
            .is_ok());
        assert!(acl
            .authorize(9, "GET", &["read"], &["other".into()], &[], &[])
            .is_err());
    }

    #[test]
    fn default_user_survives_config_overlay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"username": "default", "excluded_commands": ["flushall"]}}]"#
        )
        .unwrap();

        let acl = Acl::load(false, None, Some(file.path())).unwrap();
        assert!(acl.users.read().iter().any(|u| u.username == "default"));
    }
}
