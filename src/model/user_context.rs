use serde::{Deserialize, Serialize};

/// Identity of the caller, extracted from request headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub user_name: Option<String>,
}

impl UserContext {
    /// Create a new UserContext with just a user ID
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: None,
        }
    }

    pub fn with_name(user_id: &str, name: Option<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: name,
        }
    }
}
