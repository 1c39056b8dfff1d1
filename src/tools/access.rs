//! Tool access control: caller capabilities against tool requirements.
//!
//! Tools declare `requires_write` / `requires_admin`; the caller identity says
//! what the caller may do. A tool with neither flag is open to everyone.

use serde::{Deserialize, Serialize};

use super::registry::ToolDescriptor;
use crate::types::{Error, Result};

/// Who is calling, and with which capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    #[serde(default = "default_true")]
    pub can_write: bool,
    #[serde(default)]
    pub is_admin: bool,
}

fn default_true() -> bool {
    true
}

impl CallerIdentity {
    /// Regular user: may read and write their own journal.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            can_write: true,
            is_admin: false,
        }
    }

    pub fn read_only(user_id: impl Into<String>) -> Self {
        Self {
            can_write: false,
            ..Self::user(user_id)
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::user(user_id)
        }
    }
}

/// Check whether `caller` may invoke the tool described by `descriptor`.
pub fn check_access(caller: &CallerIdentity, descriptor: &ToolDescriptor) -> Result<()> {
    if descriptor.requires_admin && !caller.is_admin {
        return Err(Error::permission_denied(format!(
            "Tool '{}' requires admin access",
            descriptor.name
        )));
    }
    if descriptor.requires_write && !caller.can_write {
        return Err(Error::permission_denied(format!(
            "Tool '{}' requires write access",
            descriptor.name
        )));
    }
    Ok(())
}
