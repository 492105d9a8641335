use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Access level stored on annotation table metadata.
///
/// These flags are recorded and returned to callers but not enforced here;
/// enforcement belongs to the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    Private,
    Group,
    Public,
}

impl Permission {
    pub const fn as_str(self) -> &'static str {
        match self {
            Permission::Private => "PRIVATE",
            Permission::Group => "GROUP",
            Permission::Public => "PUBLIC",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRIVATE" => Ok(Permission::Private),
            "GROUP" => Ok(Permission::Group),
            "PUBLIC" => Ok(Permission::Public),
            other => Err(Error::InvalidPermission(other.to_string())),
        }
    }
}
