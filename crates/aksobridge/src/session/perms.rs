//! Local evaluation of the upstream permission set.

use std::collections::HashMap;

use serde::Deserialize;

use super::FieldAccess;

/// The body of `GET /perms`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Codeholder fields and their flags; `None` means unrestricted.
    #[serde(default)]
    pub member_fields: Option<HashMap<String, String>>,
    #[serde(default)]
    pub own_member_fields: Option<HashMap<String, String>>,
}

impl Permissions {
    /// Granted exactly, or through a `prefix.*` or `*` wildcard.
    pub fn has_perm(&self, perm: &str) -> bool {
        self.permissions.iter().any(|granted| {
            if granted == perm || granted == "*" {
                return true;
            }
            granted
                .strip_suffix('*')
                .is_some_and(|prefix| prefix.ends_with('.') && perm.starts_with(prefix))
        })
    }

    pub fn has_codeholder_field(&self, access: &FieldAccess) -> bool {
        field_allowed(self.member_fields.as_ref(), access)
    }

    pub fn has_own_codeholder_field(&self, access: &FieldAccess) -> bool {
        field_allowed(self.own_member_fields.as_ref(), access)
    }
}

fn field_allowed(fields: Option<&HashMap<String, String>>, access: &FieldAccess) -> bool {
    let Some(fields) = fields else {
        return true;
    };
    fields
        .get(&access.field)
        .is_some_and(|granted| access.flags.chars().all(|flag| granted.contains(flag)))
}
