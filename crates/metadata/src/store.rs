//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{MemberRepo, PartRepo, ReconcileRepo, RepositoryRepo, ResourceRepo, UserRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UserRepo + RepositoryRepo + MemberRepo + ResourceRepo + PartRepo + ReconcileRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Close the connection pool, waiting for checked-out connections.
    async fn close(&self);
}

/// SQLite-based metadata store.
///
/// SQLite serializes writers at the database level, so every transaction is
/// serializable. Lock contention from other processes surfaces as
/// `SQLITE_BUSY`, which is classified as a serialization failure.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite store.
    pub async fn new(path: impl AsRef<Path>, acquire_timeout: Duration) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // A single connection keeps writers from tripping over each other's
            // locks; concurrent callers queue on the pool instead.
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "opened SQLite metadata store");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::gate::{self, Access, Admission, GateFacts, ParentState};
    use crate::hierarchy::{self, PathRewrite};
    use crate::models::*;
    use crate::repos::{
        AccountRemoval, AccountSnapshot, MemberRemoval, MemberSnapshot, ResourceSnapshot,
        SubtreeSnapshot,
    };
    use cabinet_core::{
        MemberId, Partition, Permission, RepositoryId, ResourceId, ResourceKind, Role, UserId,
        Visibility, path,
    };
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;

    /// SQLite's default host parameter limit is far above this.
    const ID_BATCH: usize = 500;

    async fn load_access(
        conn: &mut SqliteConnection,
        actor: Option<UserId>,
        repository_id: RepositoryId,
    ) -> MetadataResult<Access> {
        let row = sqlx::query_as::<_, AccessRow>(
            r#"
            SELECT r.repository_id, r.owner_id, r.visibility, m.permission AS member_permission
            FROM repositories r
            LEFT JOIN members m ON m.repository_id = r.repository_id AND m.user_id = ?
            WHERE r.repository_id = ?
            "#,
        )
        .bind(actor.map(UserId::get))
        .bind(repository_id.get())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("repository {repository_id}")))?;

        Access::from_row(actor, &row)
    }

    async fn fetch_user(conn: &mut SqliteConnection, user_id: UserId) -> MetadataResult<UserRow> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = ?")
            .bind(user_id.get())
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("user {user_id}")))
    }

    async fn fetch_resource(
        conn: &mut SqliteConnection,
        resource_id: ResourceId,
    ) -> MetadataResult<Option<ResourceRow>> {
        let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE resource_id = ?")
            .bind(resource_id.get())
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    async fn fetch_kind(
        conn: &mut SqliteConnection,
        resource_id: ResourceId,
        kind: ResourceKind,
    ) -> MetadataResult<ResourceRow> {
        fetch_resource(conn, resource_id)
            .await?
            .filter(|r| r.kind == kind.as_str())
            .ok_or_else(|| MetadataError::NotFound(format!("{kind} {resource_id}")))
    }

    async fn consumed(conn: &mut SqliteConnection, user_id: UserId) -> MetadataResult<i64> {
        let consumed: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0) FROM resources WHERE owner_id = ? AND kind = 'file'",
        )
        .bind(user_id.get())
        .fetch_one(&mut *conn)
        .await?;
        Ok(consumed)
    }

    async fn path_taken(
        conn: &mut SqliteConnection,
        repository_id: RepositoryId,
        path: &str,
    ) -> MetadataResult<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM resources WHERE repository_id = ? AND path = ?)",
        )
        .bind(repository_id.get())
        .bind(path)
        .fetch_one(&mut *conn)
        .await?;
        Ok(taken)
    }

    /// The folder record plus everything whose path starts with `folder/`.
    async fn load_subtree(
        conn: &mut SqliteConnection,
        repository_id: i64,
        folder_path: &str,
    ) -> MetadataResult<Vec<ResourceRow>> {
        let prefix = format!("{folder_path}/");
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT * FROM resources
            WHERE repository_id = ? AND (path = ? OR substr(path, 1, ?) = ?)
            ORDER BY path
            "#,
        )
        .bind(repository_id)
        .bind(folder_path)
        .bind(prefix_len(&prefix)?)
        .bind(&prefix)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    fn prefix_len(prefix: &str) -> MetadataResult<i32> {
        i32::try_from(prefix.chars().count())
            .map_err(|_| MetadataError::Invalid("path prefix too long".to_string()))
    }

    async fn gate_facts(
        conn: &mut SqliteConnection,
        admission: &Admission<'_>,
    ) -> MetadataResult<GateFacts> {
        let access = load_access(conn, Some(admission.actor), admission.repository_id).await?;
        let space_quota = fetch_user(conn, admission.actor).await?.space_quota;
        let consumed = consumed(conn, admission.actor).await?;
        let path_taken = path_taken(conn, admission.repository_id, admission.path).await?;

        let parent_kind = match admission.parent() {
            Some(parent) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT kind FROM resources WHERE repository_id = ? AND path = ?",
                )
                .bind(admission.repository_id.get())
                .bind(parent)
                .fetch_optional(&mut *conn)
                .await?
            }
            None => None,
        };

        Ok(GateFacts {
            access,
            space_quota,
            consumed,
            path_taken,
            parent: ParentState::from_kind(admission.parent(), parent_kind.as_deref()),
        })
    }

    /// Draw the next resource identifier. Every insert goes through here, so
    /// reserved and default-assigned identifiers never collide.
    async fn next_resource_id(conn: &mut SqliteConnection) -> MetadataResult<ResourceId> {
        let id: i64 = sqlx::query_scalar("INSERT INTO resource_ids DEFAULT VALUES RETURNING id")
            .fetch_one(&mut *conn)
            .await?;
        // sqlite_sequence keeps the high-water mark; the row itself is not needed
        sqlx::query("DELETE FROM resource_ids WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(ResourceId::new(id))
    }

    async fn insert_resource(
        conn: &mut SqliteConnection,
        admission: &Admission<'_>,
        resource_id: Option<ResourceId>,
        upload_handle: Option<&str>,
        completed_at: Option<OffsetDateTime>,
    ) -> MetadataResult<ResourceRow> {
        let facts = gate_facts(conn, admission).await?;
        gate::admit(admission, &facts)?;

        let resource_id = match resource_id {
            Some(id) => id,
            None => next_resource_id(conn).await?,
        };

        sqlx::query_as::<_, ResourceRow>(
            r#"
            INSERT INTO resources
                (resource_id, repository_id, owner_id, path, kind, size, upload_handle, upload_completed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(resource_id.get())
        .bind(admission.repository_id.get())
        .bind(admission.actor.get())
        .bind(admission.path)
        .bind(admission.kind.as_str())
        .bind(admission.size)
        .bind(upload_handle)
        .bind(completed_at)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            MetadataError::from(e).on_conflict(|| {
                format!(
                    "{} already exists in repository {}",
                    admission.path, admission.repository_id
                )
            })
        })
    }

    /// Hand `user_id`'s folders in the matching repositories to their owners.
    async fn reassign_folders(
        conn: &mut SqliteConnection,
        user_id: UserId,
        repository_id: Option<RepositoryId>,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET owner_id = (
                SELECT r.owner_id FROM repositories r WHERE r.repository_id = resources.repository_id
            )
            WHERE owner_id = ? AND kind = 'folder'
              AND (? IS NULL OR repository_id = ?)
              AND repository_id IN (SELECT repository_id FROM repositories WHERE owner_id <> ?)
            "#,
        )
        .bind(user_id.get())
        .bind(repository_id.map(RepositoryId::get))
        .bind(repository_id.map(RepositoryId::get))
        .bind(user_id.get())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    #[async_trait]
    impl UserRepo for SqliteStore {
        async fn create_user(
            &self,
            username: &str,
            role: Role,
            space_quota: i64,
        ) -> MetadataResult<UserRow> {
            sqlx::query_as::<_, UserRow>(
                "INSERT INTO users (username, role, space_quota, created_at) VALUES (?, ?, ?, ?) RETURNING *",
            )
            .bind(username)
            .bind(role.as_str())
            .bind(space_quota)
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::from(e).on_conflict(|| format!("username '{username}'"))
            })
        }

        async fn get_user(&self, user_id: UserId) -> MetadataResult<Option<UserRow>> {
            let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE user_id = ?")
                .bind(user_id.get())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn set_space_quota(&self, user_id: UserId, space_quota: i64) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE users SET space_quota = ? WHERE user_id = ?")
                .bind(space_quota)
                .bind(user_id.get())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("user {user_id}")));
            }
            Ok(())
        }

        async fn consumed_space(&self, user_id: UserId) -> MetadataResult<i64> {
            let mut conn = self.pool.acquire().await?;
            consumed(&mut conn, user_id).await
        }

        async fn account_snapshot(&self, user_id: UserId) -> MetadataResult<AccountSnapshot> {
            let mut tx = self.pool.begin().await?;
            let user = fetch_user(&mut tx, user_id).await?;

            let owned_repositories = sqlx::query_as::<_, RepositoryRow>(
                "SELECT * FROM repositories WHERE owner_id = ? ORDER BY repository_id",
            )
            .bind(user_id.get())
            .fetch_all(&mut *tx)
            .await?;

            let foreign_files = sqlx::query_as::<_, ResourceRow>(
                r#"
                SELECT res.* FROM resources res
                JOIN repositories r ON r.repository_id = res.repository_id
                WHERE res.owner_id = ? AND res.kind = 'file' AND r.owner_id <> ?
                ORDER BY res.resource_id
                "#,
            )
            .bind(user_id.get())
            .bind(user_id.get())
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(AccountSnapshot {
                user,
                owned_repositories,
                foreign_files,
            })
        }

        async fn delete_account(&self, user_id: UserId) -> MetadataResult<AccountRemoval> {
            let mut tx = self.pool.begin().await?;

            let foreign_files = sqlx::query_as::<_, ResourceRow>(
                r#"
                DELETE FROM resources
                WHERE owner_id = ? AND kind = 'file'
                  AND repository_id IN (SELECT repository_id FROM repositories WHERE owner_id <> ?)
                RETURNING *
                "#,
            )
            .bind(user_id.get())
            .bind(user_id.get())
            .fetch_all(&mut *tx)
            .await?;

            let reassigned_folders = reassign_folders(&mut tx, user_id, None).await?;

            let deleted = sqlx::query("DELETE FROM users WHERE user_id = ?")
                .bind(user_id.get())
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("user {user_id}")));
            }

            tx.commit().await?;
            Ok(AccountRemoval {
                foreign_files,
                reassigned_folders,
            })
        }
    }

    #[async_trait]
    impl RepositoryRepo for SqliteStore {
        async fn create_repository(
            &self,
            owner: UserId,
            name: &str,
            visibility: Visibility,
        ) -> MetadataResult<RepositoryRow> {
            let mut tx = self.pool.begin().await?;

            let user = fetch_user(&mut tx, owner).await?;
            if !user.role()?.can_own_repositories() {
                return Err(MetadataError::InsufficientPermission(format!(
                    "user {owner} may not own repositories"
                )));
            }

            let row = sqlx::query_as::<_, RepositoryRow>(
                "INSERT INTO repositories (owner_id, name, visibility, created_at) VALUES (?, ?, ?, ?) RETURNING *",
            )
            .bind(owner.get())
            .bind(name)
            .bind(visibility.as_str())
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| MetadataError::from(e).on_conflict(|| format!("repository '{name}'")))?;

            tx.commit().await?;
            Ok(row)
        }

        async fn get_repository(
            &self,
            repository_id: RepositoryId,
        ) -> MetadataResult<Option<RepositoryRow>> {
            let row = sqlx::query_as::<_, RepositoryRow>(
                "SELECT * FROM repositories WHERE repository_id = ?",
            )
            .bind(repository_id.get())
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_repositories(&self, user_id: UserId) -> MetadataResult<Vec<RepositorySummary>> {
            let rows = sqlx::query_as::<_, RepositorySummary>(
                r#"
                SELECT r.repository_id, r.name, r.visibility, u.username AS owner_username,
                       m.permission AS member_permission,
                       COALESCE((
                           SELECT SUM(f.size) FROM resources f
                           WHERE f.repository_id = r.repository_id AND f.owner_id = ? AND f.kind = 'file'
                       ), 0) AS uploaded_bytes
                FROM repositories r
                JOIN users u ON u.user_id = r.owner_id
                LEFT JOIN members m ON m.repository_id = r.repository_id AND m.user_id = ?
                WHERE r.owner_id = ? OR m.user_id IS NOT NULL
                ORDER BY r.name, r.repository_id
                "#,
            )
            .bind(user_id.get())
            .bind(user_id.get())
            .bind(user_id.get())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn rename_repository(
            &self,
            actor: UserId,
            repository_id: RepositoryId,
            name: &str,
        ) -> MetadataResult<RepositoryRow> {
            let mut tx = self.pool.begin().await?;
            load_access(&mut tx, Some(actor), repository_id)
                .await?
                .require_owner()?;

            let row = sqlx::query_as::<_, RepositoryRow>(
                "UPDATE repositories SET name = ? WHERE repository_id = ? RETURNING *",
            )
            .bind(name)
            .bind(repository_id.get())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| MetadataError::from(e).on_conflict(|| format!("repository '{name}'")))?;

            tx.commit().await?;
            Ok(row)
        }

        async fn set_visibility(
            &self,
            actor: UserId,
            repository_id: RepositoryId,
            visibility: Visibility,
        ) -> MetadataResult<RepositoryRow> {
            let mut tx = self.pool.begin().await?;
            load_access(&mut tx, Some(actor), repository_id)
                .await?
                .require_owner()?;

            let row = sqlx::query_as::<_, RepositoryRow>(
                "UPDATE repositories SET visibility = ? WHERE repository_id = ? RETURNING *",
            )
            .bind(visibility.as_str())
            .bind(repository_id.get())
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn access(
            &self,
            actor: Option<UserId>,
            repository_id: RepositoryId,
        ) -> MetadataResult<Access> {
            let mut conn = self.pool.acquire().await?;
            load_access(&mut conn, actor, repository_id).await
        }

        async fn delete_repository(
            &self,
            actor: UserId,
            repository_id: RepositoryId,
        ) -> MetadataResult<RepositoryRow> {
            let mut tx = self.pool.begin().await?;
            load_access(&mut tx, Some(actor), repository_id)
                .await?
                .require_owner()?;

            let row = sqlx::query_as::<_, RepositoryRow>(
                "DELETE FROM repositories WHERE repository_id = ? RETURNING *",
            )
            .bind(repository_id.get())
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl MemberRepo for SqliteStore {
        async fn add_member(
            &self,
            actor: UserId,
            repository_id: RepositoryId,
            user_id: UserId,
            permission: Permission,
        ) -> MetadataResult<MemberRow> {
            let mut tx = self.pool.begin().await?;
            let access = load_access(&mut tx, Some(actor), repository_id).await?;
            access.require_owner()?;
            if user_id == access.owner_id {
                return Err(MetadataError::AlreadyExists(format!(
                    "user {user_id} owns repository {repository_id}"
                )));
            }
            fetch_user(&mut tx, user_id).await?;

            let row = sqlx::query_as::<_, MemberRow>(
                "INSERT INTO members (repository_id, user_id, permission, created_at) VALUES (?, ?, ?, ?) RETURNING *",
            )
            .bind(repository_id.get())
            .bind(user_id.get())
            .bind(permission.as_str())
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                MetadataError::from(e).on_conflict(|| {
                    format!("user {user_id} is already a member of repository {repository_id}")
                })
            })?;

            tx.commit().await?;
            Ok(row)
        }

        async fn get_member(&self, member_id: MemberId) -> MetadataResult<Option<MemberRow>> {
            let row = sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE member_id = ?")
                .bind(member_id.get())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_members(&self, repository_id: RepositoryId) -> MetadataResult<Vec<MemberRow>> {
            let rows = sqlx::query_as::<_, MemberRow>(
                "SELECT * FROM members WHERE repository_id = ? ORDER BY member_id",
            )
            .bind(repository_id.get())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn member_snapshot(
            &self,
            actor: UserId,
            member_id: MemberId,
        ) -> MetadataResult<MemberSnapshot> {
            let mut tx = self.pool.begin().await?;
            let (member, access) = member_with_access(&mut tx, actor, member_id).await?;

            let files = sqlx::query_as::<_, ResourceRow>(
                "SELECT * FROM resources WHERE repository_id = ? AND owner_id = ? AND kind = 'file' ORDER BY resource_id",
            )
            .bind(member.repository_id)
            .bind(member.user_id)
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(MemberSnapshot {
                member,
                access,
                files,
            })
        }

        async fn delete_member(
            &self,
            actor: UserId,
            member_id: MemberId,
        ) -> MetadataResult<MemberRemoval> {
            let mut tx = self.pool.begin().await?;
            let (member, _) = member_with_access(&mut tx, actor, member_id).await?;

            let files = sqlx::query_as::<_, ResourceRow>(
                "DELETE FROM resources WHERE repository_id = ? AND owner_id = ? AND kind = 'file' RETURNING *",
            )
            .bind(member.repository_id)
            .bind(member.user_id)
            .fetch_all(&mut *tx)
            .await?;

            let reassigned_folders = reassign_folders(
                &mut tx,
                UserId::new(member.user_id),
                Some(RepositoryId::new(member.repository_id)),
            )
            .await?;

            sqlx::query("DELETE FROM members WHERE member_id = ?")
                .bind(member_id.get())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(MemberRemoval {
                files,
                reassigned_folders,
            })
        }
    }

    /// Load a membership and check the actor is its owner or the member.
    async fn member_with_access(
        conn: &mut SqliteConnection,
        actor: UserId,
        member_id: MemberId,
    ) -> MetadataResult<(MemberRow, Access)> {
        let member = sqlx::query_as::<_, MemberRow>("SELECT * FROM members WHERE member_id = ?")
            .bind(member_id.get())
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("member {member_id}")))?;

        let access = load_access(conn, Some(actor), RepositoryId::new(member.repository_id)).await?;
        if !access.is_owner() && actor.get() != member.user_id {
            return Err(MetadataError::InsufficientPermission(format!(
                "user {actor} may not remove member {member_id}"
            )));
        }
        Ok((member, access))
    }

    #[async_trait]
    impl ResourceRepo for SqliteStore {
        async fn check_admission(&self, admission: &Admission<'_>) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let facts = gate_facts(&mut tx, admission).await?;
            tx.commit().await?;
            gate::admit(admission, &facts)
        }

        async fn reserve_resource_id(&self) -> MetadataResult<ResourceId> {
            let mut tx = self.pool.begin().await?;
            let id = next_resource_id(&mut tx).await?;
            tx.commit().await?;
            Ok(id)
        }

        async fn insert_file(
            &self,
            admission: &Admission<'_>,
            resource_id: ResourceId,
            upload_handle: &str,
        ) -> MetadataResult<ResourceRow> {
            let mut tx = self.pool.begin().await?;
            let row = insert_resource(
                &mut tx,
                admission,
                Some(resource_id),
                Some(upload_handle),
                None,
            )
            .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn insert_folder(&self, admission: &Admission<'_>) -> MetadataResult<ResourceRow> {
            let mut tx = self.pool.begin().await?;
            let row = insert_resource(
                &mut tx,
                admission,
                None,
                None,
                Some(OffsetDateTime::now_utc()),
            )
            .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn get_resource(
            &self,
            resource_id: ResourceId,
        ) -> MetadataResult<Option<ResourceRow>> {
            let mut conn = self.pool.acquire().await?;
            fetch_resource(&mut conn, resource_id).await
        }

        async fn find_resource(
            &self,
            repository_id: RepositoryId,
            path: &str,
        ) -> MetadataResult<Option<ResourceRow>> {
            let row = sqlx::query_as::<_, ResourceRow>(
                "SELECT * FROM resources WHERE repository_id = ? AND path = ?",
            )
            .bind(repository_id.get())
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_resources(
            &self,
            repository_id: RepositoryId,
        ) -> MetadataResult<Vec<ResourceRow>> {
            let rows = sqlx::query_as::<_, ResourceRow>(
                "SELECT * FROM resources WHERE repository_id = ? ORDER BY path",
            )
            .bind(repository_id.get())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn resource_snapshot(
            &self,
            actor: Option<UserId>,
            resource_id: ResourceId,
        ) -> MetadataResult<ResourceSnapshot> {
            let mut tx = self.pool.begin().await?;
            let resource = fetch_resource(&mut tx, resource_id)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("resource {resource_id}")))?;
            let access = load_access(&mut tx, actor, resource.repository()).await?;

            let parts = sqlx::query_as::<_, PartRow>(
                "SELECT * FROM resource_parts WHERE resource_id = ? ORDER BY part_number",
            )
            .bind(resource_id.get())
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(ResourceSnapshot {
                resource,
                access,
                parts,
            })
        }

        async fn subtree_snapshot(
            &self,
            actor: UserId,
            folder_id: ResourceId,
        ) -> MetadataResult<SubtreeSnapshot> {
            let mut tx = self.pool.begin().await?;
            let folder = fetch_kind(&mut tx, folder_id, ResourceKind::Folder).await?;
            let access = load_access(&mut tx, Some(actor), folder.repository()).await?;
            let records = load_subtree(&mut tx, folder.repository_id, &folder.path).await?;
            tx.commit().await?;

            Ok(SubtreeSnapshot {
                folder,
                access,
                records,
            })
        }

        async fn rename_resource(
            &self,
            actor: UserId,
            resource_id: ResourceId,
            kind: ResourceKind,
            new_name: &str,
        ) -> MetadataResult<Vec<PathRewrite>> {
            let mut tx = self.pool.begin().await?;
            let resource = fetch_kind(&mut tx, resource_id, kind).await?;
            load_access(&mut tx, Some(actor), resource.repository())
                .await?
                .require_modify()?;

            let new_path = path::with_name(&resource.path, new_name);
            if new_path == resource.path {
                tx.commit().await?;
                return Ok(Vec::new());
            }
            if path_taken(&mut tx, resource.repository(), &new_path).await? {
                return Err(MetadataError::AlreadyExists(format!(
                    "{new_path} already exists in repository {}",
                    resource.repository_id
                )));
            }

            let rewrites = match kind {
                ResourceKind::Folder => {
                    let records =
                        load_subtree(&mut tx, resource.repository_id, &resource.path).await?;
                    hierarchy::rename(&records, &resource.path, &new_path)
                }
                ResourceKind::File => vec![PathRewrite {
                    resource_id: resource.resource_id,
                    old_path: resource.path.clone(),
                    new_path,
                }],
            };

            for rewrite in &rewrites {
                sqlx::query("UPDATE resources SET path = ? WHERE resource_id = ?")
                    .bind(&rewrite.new_path)
                    .bind(rewrite.resource_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        MetadataError::from(e)
                            .on_conflict(|| format!("{} already exists", rewrite.new_path))
                    })?;
            }

            tx.commit().await?;
            Ok(rewrites)
        }

        async fn complete_upload(
            &self,
            actor: UserId,
            resource_id: ResourceId,
            upload_handle: &str,
            completed_at: OffsetDateTime,
        ) -> MetadataResult<ResourceRow> {
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query_as::<_, ResourceRow>(
                r#"
                UPDATE resources SET upload_completed_at = ?, upload_handle = NULL
                WHERE resource_id = ? AND owner_id = ? AND kind = 'file'
                  AND upload_completed_at IS NULL AND upload_handle = ?
                RETURNING *
                "#,
            )
            .bind(completed_at)
            .bind(resource_id.get())
            .bind(actor.get())
            .bind(upload_handle)
            .fetch_optional(&mut *tx)
            .await?;

            let row = match updated {
                Some(row) => row,
                None => {
                    let current = fetch_kind(&mut tx, resource_id, ResourceKind::File).await?;
                    if current.owner() != actor {
                        return Err(MetadataError::InsufficientPermission(format!(
                            "only the uploader may complete file {resource_id}"
                        )));
                    }
                    if current.upload_completed_at.is_none() {
                        return Err(MetadataError::InvalidState(format!(
                            "file {resource_id} is no longer held by upload {upload_handle}"
                        )));
                    }
                    current
                }
            };

            tx.commit().await?;
            Ok(row)
        }

        async fn remove_upload(
            &self,
            actor: Option<UserId>,
            resource_id: ResourceId,
            upload_handle: &str,
        ) -> MetadataResult<ResourceRow> {
            let mut tx = self.pool.begin().await?;
            let removed = sqlx::query_as::<_, ResourceRow>(
                r#"
                DELETE FROM resources
                WHERE resource_id = ? AND kind = 'file'
                  AND upload_completed_at IS NULL AND upload_handle = ?
                  AND (? IS NULL OR owner_id = ?)
                RETURNING *
                "#,
            )
            .bind(resource_id.get())
            .bind(upload_handle)
            .bind(actor.map(UserId::get))
            .bind(actor.map(UserId::get))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = removed else {
                let current = fetch_kind(&mut tx, resource_id, ResourceKind::File).await?;
                return Err(if actor.is_some_and(|a| a != current.owner()) {
                    MetadataError::InsufficientPermission(format!(
                        "only the uploader may abort file {resource_id}"
                    ))
                } else {
                    MetadataError::InvalidState(format!(
                        "file {resource_id} has no outstanding upload {upload_handle}"
                    ))
                });
            };

            tx.commit().await?;
            Ok(row)
        }

        async fn delete_file(
            &self,
            actor: UserId,
            resource_id: ResourceId,
        ) -> MetadataResult<ResourceRow> {
            let mut tx = self.pool.begin().await?;
            let file = fetch_kind(&mut tx, resource_id, ResourceKind::File).await?;
            load_access(&mut tx, Some(actor), file.repository())
                .await?
                .require_modify()?;

            let row = sqlx::query_as::<_, ResourceRow>(
                "DELETE FROM resources WHERE resource_id = ? RETURNING *",
            )
            .bind(resource_id.get())
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn delete_subtree(
            &self,
            actor: UserId,
            folder_id: ResourceId,
        ) -> MetadataResult<Vec<ResourceRow>> {
            let mut tx = self.pool.begin().await?;
            let folder = fetch_kind(&mut tx, folder_id, ResourceKind::Folder).await?;
            load_access(&mut tx, Some(actor), folder.repository())
                .await?
                .require_modify()?;

            let prefix = format!("{}/", folder.path);
            let rows = sqlx::query_as::<_, ResourceRow>(
                r#"
                DELETE FROM resources
                WHERE repository_id = ? AND (path = ? OR substr(path, 1, ?) = ?)
                RETURNING *
                "#,
            )
            .bind(folder.repository_id)
            .bind(&folder.path)
            .bind(prefix_len(&prefix)?)
            .bind(&prefix)
            .fetch_all(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl PartRepo for SqliteStore {
        async fn record_part(
            &self,
            actor: UserId,
            resource_id: ResourceId,
            part_number: u32,
            integrity_token: &str,
        ) -> MetadataResult<PartRow> {
            if integrity_token.is_empty() {
                return Err(MetadataError::Invalid(
                    "integrity token must not be empty".to_string(),
                ));
            }

            let mut tx = self.pool.begin().await?;
            let file = fetch_kind(&mut tx, resource_id, ResourceKind::File).await?;
            if file.owner() != actor {
                return Err(MetadataError::InsufficientPermission(format!(
                    "only the uploader may acknowledge parts of file {resource_id}"
                )));
            }
            if !file.upload_state().is_active() {
                return Err(MetadataError::InvalidState(format!(
                    "upload of file {resource_id} is already completed"
                )));
            }
            let partition = Partition::for_size(file.byte_size()?)?;
            if !partition.contains(part_number) {
                return Err(MetadataError::Invalid(format!(
                    "part {part_number} is outside 1..={}",
                    partition.part_count
                )));
            }

            let row = sqlx::query_as::<_, PartRow>(
                r#"
                INSERT INTO resource_parts (resource_id, part_number, integrity_token, created_at)
                VALUES (?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(resource_id.get())
            .bind(part_number as i32)
            .bind(integrity_token)
            .bind(OffsetDateTime::now_utc())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                MetadataError::from(e).on_conflict(|| {
                    format!("part {part_number} of file {resource_id} already acknowledged")
                })
            })?;

            tx.commit().await?;
            Ok(row)
        }

        async fn list_parts(&self, resource_id: ResourceId) -> MetadataResult<Vec<PartRow>> {
            let rows = sqlx::query_as::<_, PartRow>(
                "SELECT * FROM resource_parts WHERE resource_id = ? ORDER BY part_number",
            )
            .bind(resource_id.get())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ReconcileRepo for SqliteStore {
        async fn stale_uploads(
            &self,
            created_before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<ResourceRow>> {
            let rows = sqlx::query_as::<_, ResourceRow>(
                r#"
                SELECT * FROM resources
                WHERE kind = 'file' AND upload_completed_at IS NULL AND created_at < ?
                ORDER BY created_at
                LIMIT ?
                "#,
            )
            .bind(created_before)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn resources_by_ids(&self, resource_ids: &[i64]) -> MetadataResult<Vec<ResourceRow>> {
            let mut rows = Vec::with_capacity(resource_ids.len());
            for batch in resource_ids.chunks(ID_BATCH) {
                let mut builder =
                    sqlx::QueryBuilder::<Sqlite>::new("SELECT * FROM resources WHERE resource_id IN (");
                let mut separated = builder.separated(", ");
                for id in batch {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");

                rows.extend(
                    builder
                        .build_query_as::<ResourceRow>()
                        .fetch_all(&self.pool)
                        .await?,
                );
            }
            Ok(rows)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('guest', 'user', 'admin')),
    space_quota INTEGER NOT NULL CHECK (space_quota >= 0),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repositories (
    repository_id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    visibility TEXT NOT NULL CHECK (visibility IN ('public', 'private')),
    created_at TEXT NOT NULL,
    UNIQUE (owner_id, name)
);

CREATE TABLE IF NOT EXISTS members (
    member_id INTEGER PRIMARY KEY AUTOINCREMENT,
    repository_id INTEGER NOT NULL REFERENCES repositories(repository_id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    permission TEXT NOT NULL CHECK (permission IN ('full', 'read')),
    created_at TEXT NOT NULL,
    UNIQUE (repository_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);

CREATE TABLE IF NOT EXISTS resource_ids (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);

CREATE TABLE IF NOT EXISTS resources (
    resource_id INTEGER PRIMARY KEY,
    repository_id INTEGER NOT NULL REFERENCES repositories(repository_id) ON DELETE CASCADE,
    owner_id INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    path TEXT NOT NULL CHECK (path <> ''),
    kind TEXT NOT NULL CHECK (kind IN ('file', 'folder')),
    size INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
    upload_handle TEXT,
    upload_completed_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (repository_id, path)
);
CREATE INDEX IF NOT EXISTS idx_resources_owner ON resources(owner_id, kind);
CREATE INDEX IF NOT EXISTS idx_resources_pending ON resources(created_at) WHERE upload_completed_at IS NULL;

CREATE TABLE IF NOT EXISTS resource_parts (
    resource_id INTEGER NOT NULL REFERENCES resources(resource_id) ON DELETE CASCADE,
    part_number INTEGER NOT NULL CHECK (part_number > 0),
    integrity_token TEXT NOT NULL CHECK (integrity_token <> ''),
    created_at TEXT NOT NULL,
    PRIMARY KEY (resource_id, part_number)
);
"#;
