use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// Database of hosted repositories and their deployments
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Repository record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub deploy_branch: String,
    pub latest_sha: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Lifecycle of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "running" => Ok(DeploymentStatus::Running),
            "success" => Ok(DeploymentStatus::Success),
            "failed" => Ok(DeploymentStatus::Failed),
            other => Err(format!("unknown deployment status: {}", other)),
        }
    }
}

/// Deployment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub id: i64,
    pub repo_id: i64,
    pub branch: String,
    pub commit_sha: String,
    pub status: DeploymentStatus,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

const REPOSITORY_COLUMNS: &str =
    "id, name, description, deploy_branch, latest_sha, created_at, updated_at";
const DEPLOYMENT_COLUMNS: &str =
    "id, repo_id, branch, commit_sha, status, is_active, created_at, updated_at";

fn repository_from_row(r: &SqliteRow) -> Repository {
    Repository {
        id: r.get("id"),
        name: r.get("name"),
        description: r.get("description"),
        deploy_branch: r.get("deploy_branch"),
        latest_sha: r.get("latest_sha"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn deployment_from_row(r: &SqliteRow) -> Result<Deployment, sqlx::Error> {
    let status: String = r.get("status");
    let status = status.parse().map_err(|e: String| sqlx::Error::Decode(e.into()))?;
    Ok(Deployment {
        id: r.get("id"),
        repo_id: r.get("repo_id"),
        branch: r.get("branch"),
        commit_sha: r.get("commit_sha"),
        status,
        is_active: r.get("is_active"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

impl Database {
    /// Connect to the SQLite database
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Database { pool })
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                deploy_branch TEXT NOT NULL DEFAULT 'main',
                latest_sha TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id INTEGER NOT NULL,
                branch TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                is_active BOOLEAN NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (repo_id) REFERENCES repositories(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ============ Repository Methods ============

    /// Create a new repository entry
    pub async fn create_repository(
        &self,
        name: &str,
        description: &str,
        deploy_branch: &str,
    ) -> Result<Repository, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO repositories (name, description, deploy_branch) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(deploy_branch)
        .execute(&self.pool)
        .await?;

        self.get_repository(result.last_insert_rowid())
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Get repository by id
    pub async fn get_repository(&self, id: i64) -> Result<Option<Repository>, sqlx::Error> {
        let query = format!("SELECT {} FROM repositories WHERE id = ?", REPOSITORY_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(repository_from_row))
    }

    /// Get repository by name
    pub async fn get_repository_by_name(&self, name: &str) -> Result<Option<Repository>, sqlx::Error> {
        let query = format!("SELECT {} FROM repositories WHERE name = ?", REPOSITORY_COLUMNS);
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(repository_from_row))
    }

    /// List all repositories, newest first
    pub async fn list_repositories(&self) -> Result<Vec<Repository>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM repositories ORDER BY created_at DESC, id DESC",
            REPOSITORY_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(repository_from_row).collect())
    }

    /// Update a repository
    pub async fn update_repository(
        &self,
        id: i64,
        description: Option<&str>,
        deploy_branch: Option<&str>,
        latest_sha: Option<&str>,
    ) -> Result<Option<Repository>, sqlx::Error> {
        let mut updates = Vec::new();
        if description.is_some() {
            updates.push("description = ?");
        }
        if deploy_branch.is_some() {
            updates.push("deploy_branch = ?");
        }
        if latest_sha.is_some() {
            updates.push("latest_sha = ?");
        }

        if updates.is_empty() {
            return self.get_repository(id).await;
        }

        updates.push("updated_at = CURRENT_TIMESTAMP");
        let query = format!(
            "UPDATE repositories SET {} WHERE id = ?",
            updates.join(", ")
        );

        let mut q = sqlx::query(&query);
        if let Some(d) = description {
            q = q.bind(d);
        }
        if let Some(b) = deploy_branch {
            q = q.bind(b);
        }
        if let Some(s) = latest_sha {
            q = q.bind(s);
        }
        q = q.bind(id);
        q.execute(&self.pool).await?;

        self.get_repository(id).await
    }

    /// Delete a repository and its deployments. Returns whether a row was removed.
    pub async fn delete_repository(&self, id: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM deployments WHERE repo_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    // ============ Deployment Methods ============

    /// Record a new deployment
    pub async fn create_deployment(
        &self,
        repo_id: i64,
        branch: &str,
        commit_sha: &str,
        status: DeploymentStatus,
    ) -> Result<Deployment, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO deployments (repo_id, branch, commit_sha, status) VALUES (?, ?, ?, ?)",
        )
        .bind(repo_id)
        .bind(branch)
        .bind(commit_sha)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        self.get_deployment(result.last_insert_rowid())
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Get deployment by id
    pub async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>, sqlx::Error> {
        let query = format!("SELECT {} FROM deployments WHERE id = ?", DEPLOYMENT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deployment_from_row).transpose()
    }

    /// Move a deployment to `status`
    pub async fn update_deployment_status(
        &self,
        id: i64,
        status: DeploymentStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE deployments SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a deployment active and every other deployment of its repository inactive
    pub async fn activate_deployment(&self, id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT repo_id FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let repo_id: i64 = row.get("repo_id");

        sqlx::query(
            "UPDATE deployments SET is_active = 0, updated_at = CURRENT_TIMESTAMP WHERE repo_id = ? AND is_active = 1",
        )
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE deployments SET is_active = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    /// Delete a deployment record
    pub async fn delete_deployment(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List deployments of a repository, newest first
    pub async fn list_deployments(&self, repo_id: i64) -> Result<Vec<Deployment>, sqlx::Error> {
        let query = format!(
            "SELECT {} FROM deployments WHERE repo_id = ? ORDER BY id DESC",
            DEPLOYMENT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(deployment_from_row).collect()
    }
}
