use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialRef {
    pub name: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub enum Credential {
    UserPassword {
        username: String,
        password: String,
    },
    SshKey {
        username: String,
        key_path: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .field("password", &"******")
                .finish(),
            Credential::SshKey {
                username,
                key_path,
                ..
            } => f
                .debug_struct("SshKey")
                .field("username", username)
                .field("key_path", key_path)
                .field("passphrase", &"******")
                .finish(),
        }
    }
}
