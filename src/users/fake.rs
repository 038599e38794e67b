use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::error::StoreError;
use super::repo::UserRepository;
use super::repo_types::{NewUser, User};

/// In-memory [`UserRepository`] for tests. Mirrors the partial unique indexes
/// of the real table: only live rows reserve a username or email.
#[derive(Debug, Default, Clone)]
pub struct InMemoryUserRepository {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    rows: BTreeMap<i64, User>,
}

impl Inner {
    fn live(&self) -> impl Iterator<Item = &User> {
        self.rows.values().filter(|u| u.deleted_at.is_none())
    }

    fn taken(&self, except: Option<i64>, username: &str, email: &str) -> bool {
        self.live()
            .filter(|u| Some(u.id) != except)
            .any(|u| u.username == username || u.email == email)
    }
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw row lookup, soft-deleted rows included.
    pub async fn raw(&self, id: i64) -> Option<User> {
        self.inner.read().await.rows.get(&id).cloned()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.taken(None, &user.username, &user.email) {
            return Err(StoreError::Conflict);
        }
        inner.next_id += 1;
        let now = OffsetDateTime::now_utc();
        let row = User {
            id: inner.next_id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: user.is_active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_by_id(&self, id: i64) -> Result<User, StoreError> {
        let inner = self.inner.read().await;
        let user = inner
            .live()
            .find(|u| u.id == id)
            .cloned()
            .ok_or(StoreError::NotFound);
        user
    }

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError> {
        let inner = self.inner.read().await;
        let user = inner
            .live()
            .find(|u| u.email == email)
            .cloned()
            .ok_or(StoreError::NotFound);
        user
    }

    async fn get_by_username(&self, username: &str) -> Result<User, StoreError> {
        let inner = self.inner.read().await;
        let user = inner
            .live()
            .find(|u| u.username == username)
            .cloned()
            .ok_or(StoreError::NotFound);
        user
    }

    async fn list(&self, offset: i64, limit: i64) -> Result<(Vec<User>, i64), StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<User> = inner.live().cloned().collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let total = rows.len() as i64;
        let page = rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn update(&self, user: &User) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        let exists = inner
            .rows
            .get(&user.id)
            .is_some_and(|u| u.deleted_at.is_none());
        if !exists {
            return Err(StoreError::NotFound);
        }
        if inner.taken(Some(user.id), &user.username, &user.email) {
            return Err(StoreError::Conflict);
        }
        let row = inner.rows.get_mut(&user.id).ok_or(StoreError::NotFound)?;
        row.username = user.username.clone();
        row.email = user.email.clone();
        row.password_hash = user.password_hash.clone();
        row.first_name = user.first_name.clone();
        row.last_name = user.last_name.clone();
        row.is_active = user.is_active;
        row.updated_at = OffsetDateTime::now_utc();
        Ok(row.clone())
    }

    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) if row.deleted_at.is_none() => {
                let now = OffsetDateTime::now_utc();
                row.deleted_at = Some(now);
                row.updated_at = now;
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.into(),
            email: format!("{name}@example.com"),
            password_hash: "hash".into(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn duplicate_username_or_email_conflicts() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("alice")).await.unwrap();

        let mut same_email = new_user("bob");
        same_email.email = "alice@example.com".into();
        assert_eq!(repo.create(same_email).await.unwrap_err(), StoreError::Conflict);
        assert_eq!(
            repo.create(new_user("alice")).await.unwrap_err(),
            StoreError::Conflict
        );
    }

    #[tokio::test]
    async fn lookups_find_live_rows_by_each_key() {
        let repo = InMemoryUserRepository::new();
        let alice = repo.create(new_user("alice")).await.unwrap();

        assert_eq!(repo.get_by_id(alice.id).await.unwrap().username, "alice");
        assert_eq!(repo.get_by_email("alice@example.com").await.unwrap().id, alice.id);
        assert_eq!(repo.get_by_username("alice").await.unwrap().id, alice.id);
        assert_eq!(
            repo.get_by_email("nobody@example.com").await.unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn lookups_skip_deleted_rows() {
        let repo = InMemoryUserRepository::new();
        let alice = repo.create(new_user("alice")).await.unwrap();
        repo.delete(alice.id).await.unwrap();

        assert_eq!(repo.get_by_id(alice.id).await.unwrap_err(), StoreError::NotFound);
        assert_eq!(
            repo.get_by_username("alice").await.unwrap_err(),
            StoreError::NotFound
        );
        assert!(repo.raw(alice.id).await.unwrap().deleted_at.is_some());

        // identifiers are released once the row is soft-deleted
        let again = repo.create(new_user("alice")).await.unwrap();
        assert_ne!(again.id, alice.id);
    }

    #[tokio::test]
    async fn update_conflicts_with_another_live_user() {
        let repo = InMemoryUserRepository::new();
        repo.create(new_user("alice")).await.unwrap();
        let mut bob = repo.create(new_user("bob")).await.unwrap();

        bob.email = "alice@example.com".into();
        assert_eq!(repo.update(&bob).await.unwrap_err(), StoreError::Conflict);
    }

    #[tokio::test]
    async fn list_is_newest_first_with_total() {
        let repo = InMemoryUserRepository::new();
        for name in ["a", "b", "c"] {
            repo.create(new_user(name)).await.unwrap();
        }
        let (page, total) = repo.list(0, 2).await.unwrap();
        assert_eq!(total, 3);
        let names: Vec<_> = page.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, ["c", "b"]);

        let (page, _) = repo.list(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].username, "a");
    }
}
