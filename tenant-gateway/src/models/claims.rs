use serde::{Deserialize, Serialize};

/// Claims of a verified identity token.
///
/// Missing claims decode to empty values; an identity without groups simply
/// fails tenant resolution later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// Group memberships in the order the identity provider lists them.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, rename = "email_verified")]
    pub email_verified: bool,
}

impl IdentityClaims {
    pub fn new(email: impl Into<String>, groups: &[&str]) -> Self {
        Self {
            email: email.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Self::default()
        }
    }
}
