//! Signed-in user identity

use serde::{Deserialize, Serialize};

/// Reference to the role assigned to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: u64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: RoleRef,
    pub is_active: bool,
}

impl Identity {
    /// "First Last", falling back to the email when both names are blank
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(first: &str, last: &str) -> Identity {
        Identity {
            id: 7,
            email: "ada@example.com".to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            role: RoleRef {
                id: 2,
                name: "Admin".to_string(),
            },
            is_active: true,
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(identity("Ada", "Lovelace").display_name(), "Ada Lovelace");
        assert_eq!(identity("Ada", "").display_name(), "Ada");
        assert_eq!(identity(" ", "").display_name(), "ada@example.com");
    }

    #[test]
    fn test_camel_case_fields() {
        let json = serde_json::to_value(identity("Ada", "Lovelace")).unwrap();
        assert_eq!(json["firstName"], "Ada");
        assert_eq!(json["lastName"], "Lovelace");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["role"]["name"], "Admin");
    }
}
