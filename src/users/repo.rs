use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error};

use super::error::StoreError;
use super::repo_types::{NewUser, User};

/// Persistence for [`User`] records.
///
/// Every read ignores soft-deleted rows.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a user. `Conflict` if the username or email is taken.
    async fn create(&self, user: NewUser) -> Result<User, StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<User, StoreError>;

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError>;

    async fn get_by_username(&self, username: &str) -> Result<User, StoreError>;

    /// One page ordered newest first, plus the total number of live users.
    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<User>, i64), StoreError>;

    /// Write back every mutable column and return the stored row.
    async fn update(&self, user: &User) -> Result<User, StoreError>;

    /// Soft delete.
    async fn delete(&self, id: i64) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Single translation point from driver errors to [`StoreError`].
fn classify(op: &'static str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            debug!(op, constraint = ?db_err.constraint(), "unique violation");
            StoreError::Conflict
        }
        _ => {
            error!(op, error = %err, "user store query failed");
            StoreError::Database
        }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, email, password_hash, first_name, last_name, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, username, email, password_hash, first_name, last_name,
                      is_active, created_at, updated_at, deleted_at
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_active)
        .fetch_one(&self.db)
        .await
        .map_err(|e| classify("create", e))
    }

    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, first_name, last_name,
                   is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify("get_by_id", e))?
        .ok_or(StoreError::NotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, first_name, last_name,
                   is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE email = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify("get_by_email", e))?
        .ok_or(StoreError::NotFound)
    }

    async fn get_by_username(&self, username: &str) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, first_name, last_name,
                   is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE username = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify("get_by_username", e))?
        .ok_or(StoreError::NotFound)
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<User>, i64), StoreError> {
        let total: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM users WHERE deleted_at IS NULL"#)
                .fetch_one(&self.db)
                .await
                .map_err(|e| classify("count", e))?;

        let rows = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, first_name, last_name,
                   is_active, created_at, updated_at, deleted_at
            FROM users
            WHERE deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await
        .map_err(|e| classify("list", e))?;

        Ok((rows, total))
    }

    async fn update(&self, user: &User) -> Result<User, StoreError> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
               SET username = $2,
                   email = $3,
                   password_hash = $4,
                   first_name = $5,
                   last_name = $6,
                   is_active = $7,
                   updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL
            RETURNING id, username, email, password_hash, first_name, last_name,
                      is_active, created_at, updated_at, deleted_at
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_active)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| classify("update", e))?
        .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET deleted_at = now(), updated_at = now()
             WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await
        .map_err(|e| classify("delete", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn row_not_found_is_not_found() {
        assert_eq!(classify("t", sqlx::Error::RowNotFound), StoreError::NotFound);
    }

    #[derive(Debug)]
    struct PgError(ErrorKind);

    impl std::fmt::Display for PgError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    impl std::error::Error for PgError {}

    impl DatabaseError for PgError {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn constraint(&self) -> Option<&str> {
            Some("users_email_live_key")
        }

        fn kind(&self) -> ErrorKind {
            match &self.0 {
                ErrorKind::UniqueViolation => ErrorKind::UniqueViolation,
                _ => ErrorKind::Other,
            }
        }
    }

    fn db_error(kind: ErrorKind) -> sqlx::Error {
        sqlx::Error::Database(Box::new(PgError(kind)))
    }

    #[test]
    fn unique_violation_is_conflict() {
        assert_eq!(
            classify("create", db_error(ErrorKind::UniqueViolation)),
            StoreError::Conflict
        );
    }

    #[test]
    fn other_constraint_failures_are_database_errors() {
        assert_eq!(
            classify("create", db_error(ErrorKind::CheckViolation)),
            StoreError::Database
        );
    }

    #[test]
    fn other_driver_errors_are_opaque() {
        assert_eq!(classify("t", sqlx::Error::PoolTimedOut), StoreError::Database);
        assert_eq!(classify("t", sqlx::Error::PoolClosed), StoreError::Database);
    }

    // The tests below need a live Postgres: DATABASE_URL=... cargo test -- --ignored

    async fn pg_repo() -> PgUserRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect to test database");
        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .expect("migrations should apply");
        PgUserRepository::new(db)
    }

    fn unique_new_user(tag: &str) -> NewUser {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        NewUser {
            username: format!("{tag}_{nanos}"),
            email: format!("{tag}_{nanos}@example.com"),
            password_hash: "$argon2id$placeholder".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            is_active: true,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn pg_duplicate_email_is_conflict() {
        let repo = pg_repo().await;
        let first = unique_new_user("dup");
        repo.create(first.clone()).await.expect("first insert");

        let mut second = unique_new_user("dup2");
        second.email = first.email.clone();
        assert_eq!(repo.create(second).await.unwrap_err(), StoreError::Conflict);
    }

    #[tokio::test]
    #[ignore]
    async fn pg_soft_delete_hides_and_releases_identifiers() {
        let repo = pg_repo().await;
        let new_user = unique_new_user("gone");
        let created = repo.create(new_user.clone()).await.expect("insert");

        repo.delete(created.id).await.expect("delete");
        assert_eq!(repo.get_by_id(created.id).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(repo.delete(created.id).await.unwrap_err(), StoreError::NotFound);

        let again = repo.create(new_user).await.expect("identifiers are released");
        assert_ne!(again.id, created.id);
    }

    #[tokio::test]
    #[ignore]
    async fn pg_update_missing_row_is_not_found() {
        let repo = pg_repo().await;
        let mut user = repo.create(unique_new_user("upd")).await.expect("insert");
        user.id = i64::MAX;
        assert_eq!(repo.update(&user).await.unwrap_err(), StoreError::NotFound);
    }
}
