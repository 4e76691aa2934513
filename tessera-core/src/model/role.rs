use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Collaborator role. Declaration order is the permission order:
/// `None < Guest < Viewer < Collaborator < Editor < Admin < Owner`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    None,
    Guest,
    Viewer,
    Collaborator,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::None,
        Role::Guest,
        Role::Viewer,
        Role::Collaborator,
        Role::Editor,
        Role::Admin,
        Role::Owner,
    ];

    pub fn at_least(self, min: Role) -> bool {
        self >= min
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Guest => "guest",
            Role::Viewer => "viewer",
            Role::Collaborator => "collaborator",
            Role::Editor => "editor",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role `{s}`"))
    }
}
