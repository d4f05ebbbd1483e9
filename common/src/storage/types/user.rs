use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Id of the synthetic user injected by the environment-gated test identity
/// key. Never stored in the user table.
pub const TEST_IDENTITY_USER_ID: &str = "test-identity";

stored_object!(User, "user", {
    email: String,
    api_key: Option<String>
});

impl User {
    pub fn new(email: String) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            email,
            api_key: Some(Uuid::new_v4().to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn create_and_store(email: String, db: &SurrealDbClient) -> Result<User, AppError> {
        let user = Self::new(email);
        db.store_item(user.clone()).await?;
        Ok(user)
    }

    pub async fn find_by_api_key(
        api_key: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<User>, AppError> {
        let user: Option<User> = db
            .query("SELECT * FROM type::table($table) WHERE api_key = $api_key LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("api_key", api_key.to_string()))
            .await?
            .take(0)?;

        Ok(user)
    }

    /// The fixed identity resolved from the configured test key. Exists only
    /// at the auth boundary; nothing about it lives in the database.
    pub fn test_identity() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: TEST_IDENTITY_USER_ID.to_string(),
            email: "test-identity@localhost".to_string(),
            api_key: None,
            created_at: now,
            updated_at: now,
        }
    }
}
