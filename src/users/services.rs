use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use super::dto::{CreateUserRequest, UpdateUserRequest, UserResponse};
use super::error::{StoreError, UserError, UserResult};
use super::repo::UserRepository;
use super::repo_types::NewUser;
use crate::auth::password::{hash_password_async, verify_password_async};

/// Page size used when the caller asks for less than one row.
const FALLBACK_PAGE_SIZE: i64 = 10;

/// Business rules for user accounts. Cheap to clone; the repository is shared.
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    /// Sign up. The pre-checks are advisory; a concurrent insert that slips
    /// past them is rejected by the unique index and reported the same way.
    pub async fn create_user(&self, req: CreateUserRequest) -> UserResult<UserResponse> {
        self.ensure_absent(self.repo.get_by_email(&req.email).await)?;
        self.ensure_absent(self.repo.get_by_username(&req.username).await)?;

        let password_hash = hash(req.password).await?;

        let user = self
            .repo
            .create(NewUser {
                username: req.username,
                email: req.email,
                password_hash,
                first_name: req.first_name,
                last_name: req.last_name,
                is_active: true,
            })
            .await?;

        info!(user_id = user.id, username = %user.username, "user created");
        Ok(user.into())
    }

    pub async fn get_user(&self, id: i64) -> UserResult<UserResponse> {
        let user = self.repo.get_by_id(id).await?;
        Ok(user.into())
    }

    /// `page` and `page_size` below 1 fall back to 1 and 10. No upper bound here.
    pub async fn list_users(
        &self,
        page: i64,
        page_size: i64,
    ) -> UserResult<(Vec<UserResponse>, i64)> {
        let page = if page < 1 { 1 } else { page };
        let page_size = if page_size < 1 {
            FALLBACK_PAGE_SIZE
        } else {
            page_size
        };
        let offset = (page - 1).saturating_mul(page_size);

        let (users, total) = self.repo.list(offset, page_size).await?;
        Ok((users.into_iter().map(UserResponse::from).collect(), total))
    }

    /// Names are always overwritten; the password only when a non-empty one is given.
    pub async fn update_user(&self, id: i64, req: UpdateUserRequest) -> UserResult<UserResponse> {
        let mut user = self.repo.get_by_id(id).await?;

        user.first_name = req.first_name;
        user.last_name = req.last_name;

        if let Some(password) = req.password.filter(|p| !p.is_empty()) {
            user.password_hash = hash(password).await?;
            info!(user_id = id, "password changed");
        }

        let updated = self.repo.update(&user).await?;
        Ok(updated.into())
    }

    pub async fn delete_user(&self, id: i64) -> UserResult<()> {
        self.repo.delete(id).await?;
        info!(user_id = id, "user deleted");
        Ok(())
    }

    /// Check an email/password pair. Unknown email and wrong password are
    /// reported identically, and both pay for one argon2 verification.
    pub async fn authenticate_user(&self, email: &str, password: &str) -> UserResult<UserResponse> {
        let (user, stored_hash) = match self.repo.get_by_email(email).await {
            Ok(u) => {
                let stored_hash = u.password_hash.clone();
                (Some(u), stored_hash)
            }
            Err(StoreError::NotFound) => (None, dummy_hash().await?),
            Err(e) => return Err(e.into()),
        };

        let verified = verify_password_async(password.to_owned(), stored_hash).await;

        let Some(user) = user else {
            warn!(%email, "login unknown email");
            return Err(UserError::InvalidCredentials);
        };

        match verified {
            Ok(true) => Ok(user.into()),
            Ok(false) => {
                warn!(%email, user_id = user.id, "login invalid password");
                Err(UserError::InvalidCredentials)
            }
            Err(e) => {
                error!(error = %e, user_id = user.id, "stored password hash could not be checked");
                Err(UserError::InvalidCredentials)
            }
        }
    }

    fn ensure_absent<T>(&self, lookup: Result<T, StoreError>) -> UserResult<()> {
        match lookup {
            Ok(_) => Err(UserError::AlreadyExists),
            Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Hash verified when the email is unknown, so that path costs the same as a
/// wrong password. Computed on first use.
static DUMMY_HASH: OnceCell<String> = OnceCell::const_new();

async fn dummy_hash() -> UserResult<String> {
    DUMMY_HASH
        .get_or_try_init(|| hash("no-such-user-placeholder".to_owned()))
        .await
        .cloned()
}

async fn hash(plain: String) -> UserResult<String> {
    hash_password_async(plain).await.map_err(|e| {
        error!(error = %e, "failed to hash password");
        UserError::Internal(e.to_string())
    })
}
