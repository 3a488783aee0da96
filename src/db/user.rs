use serde::Serialize;
use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

/// A user record without secret fields. Safe to serialize to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub uuid: String,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    pub bio: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A user together with its password hash, used only for credential checks.
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

/// Fields needed to insert a new user.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub uuid: &'a str,
    /// Must already be lower-cased
    pub username: &'a str,
    pub email: &'a str,
    pub full_name: &'a str,
    pub password_hash: &'a str,
    pub avatar_url: &'a str,
    pub avatar_id: &'a str,
    pub cover_image_url: Option<&'a str>,
    pub cover_image_id: Option<&'a str>,
}

/// Which profile image a media update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    Avatar,
    CoverImage,
}

macro_rules! user_columns {
    () => {
        "id, uuid, username, email, full_name, avatar_url, cover_image_url, bio, created_at, updated_at"
    };
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    uuid: String,
    username: String,
    email: String,
    full_name: String,
    avatar_url: String,
    cover_image_url: Option<String>,
    bio: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            username: row.username,
            email: row.email,
            full_name: row.full_name,
            avatar: row.avatar_url,
            cover_image: row.cover_image_url,
            bio: row.bio,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CredentialsRow {
    #[sqlx(flatten)]
    user: UserRow,
    password_hash: String,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new user. Returns the user ID.
    /// Fails with a unique violation if the username or email is taken.
    pub async fn create(&self, user: &NewUser<'_>) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO users (uuid, username, email, full_name, password_hash, avatar_url, avatar_id, cover_image_url, cover_image_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.uuid)
        .bind(user.username)
        .bind(user.email)
        .bind(user.full_name)
        .bind(user.password_hash)
        .bind(user.avatar_url)
        .bind(user.avatar_id)
        .bind(user.cover_image_url)
        .bind(user.cover_image_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Get a user by internal ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(concat!("SELECT ", user_columns!(), " FROM users WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by public UUID.
    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> =
            sqlx::query_as(concat!("SELECT ", user_columns!(), " FROM users WHERE uuid = ?"))
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by (lower-cased) username.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Look up login credentials by username or email in a single query.
    /// A `None` handle never matches.
    pub async fn get_credentials(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<UserCredentials>, sqlx::Error> {
        let row: Option<CredentialsRow> = sqlx::query_as(concat!(
            "SELECT ",
            user_columns!(),
            ", password_hash FROM users WHERE username = ? OR email = ? LIMIT 1"
        ))
        .bind(username)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| UserCredentials {
            user: User::from(row.user),
            password_hash: row.password_hash,
        }))
    }

    /// Get the password hash for a user.
    pub async fn get_password_hash(&self, id: i64) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT password_hash FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    /// Check whether the username or email is already registered.
    pub async fn is_identifier_taken(
        &self,
        username: &str,
        email: &str,
    ) -> Result<bool, sqlx::Error> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE username = ? OR email = ?")
                .bind(username)
                .bind(email)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    /// Media ID of the image currently in `slot`.
    /// Returns `None` if the user does not exist and `Some(None)` if the slot is empty.
    pub async fn image_id(
        &self,
        id: i64,
        slot: ImageSlot,
    ) -> Result<Option<Option<String>>, sqlx::Error> {
        let sql = match slot {
            ImageSlot::Avatar => "SELECT avatar_id FROM users WHERE id = ?",
            ImageSlot::CoverImage => "SELECT cover_image_id FROM users WHERE id = ?",
        };
        let row: Option<(Option<String>,)> = sqlx::query_as(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    /// Point `slot` at a new image, but only if it still holds `expected`.
    /// Returns false if another update got there first or the user is gone.
    pub async fn swap_image(
        &self,
        id: i64,
        slot: ImageSlot,
        expected: Option<&str>,
        url: &str,
        public_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let sql = match slot {
            ImageSlot::Avatar => {
                "UPDATE users SET avatar_url = ?, avatar_id = ?, updated_at = datetime('now') WHERE id = ? AND avatar_id IS ?"
            }
            ImageSlot::CoverImage => {
                "UPDATE users SET cover_image_url = ?, cover_image_id = ?, updated_at = datetime('now') WHERE id = ? AND cover_image_id IS ?"
            }
        };
        let result = sqlx::query(sql)
            .bind(url)
            .bind(public_id)
            .bind(id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Users whose username or full name contains `term`, case-insensitively.
    pub async fn search(&self, term: &str, limit: u32) -> Result<Vec<User>, sqlx::Error> {
        let pattern = format!("%{}%", escape_like(term));
        let rows: Vec<UserRow> = sqlx::query_as(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE username LIKE ?1 ESCAPE '\\' OR full_name LIKE ?1 ESCAPE '\\'",
            " ORDER BY username LIMIT ?2"
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    /// Update profile details. `None` fields are left unchanged.
    pub async fn update_details(
        &self,
        id: i64,
        full_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET full_name = COALESCE(?, full_name), email = COALESCE(?, email), updated_at = datetime('now') WHERE id = ?",
        )
        .bind(full_name)
        .bind(email)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the password hash.
    pub async fn set_password_hash(&self, id: i64, hash: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(hash)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a user by ID.
    pub async fn delete(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Whether a sqlx error is a UNIQUE constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}
