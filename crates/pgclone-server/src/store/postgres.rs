use super::{ImageStore, InstanceStore, NewInstance, Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgclone_common::{Image, ImageId, Instance, InstanceId, NewImage};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    id           BIGSERIAL PRIMARY KEY,
    backed_up_at TIMESTAMPTZ NOT NULL,
    ready        BOOLEAN NOT NULL DEFAULT FALSE,
    anon         TEXT NOT NULL DEFAULT '',
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS instances (
    id         BIGSERIAL PRIMARY KEY,
    image_id   BIGINT NOT NULL REFERENCES images (id),
    port       INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
"#;

/// Open a pool and make sure both tables exist.
pub async fn connect_postgres(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
    info!("Database schema is up to date");
    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: i64,
    backed_up_at: DateTime<Utc>,
    ready: bool,
    #[sqlx(default)]
    anon: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ImageRow> for Image {
    fn from(row: ImageRow) -> Self {
        Image {
            id: row.id,
            backed_up_at: row.backed_up_at,
            ready: row.ready,
            anon: row.anon,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: i64,
    image_id: i64,
    port: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let port = u16::try_from(row.port)
            .map_err(|_| StoreError::Corrupt(format!("instance {} has port {}", row.id, row.port)))?;
        Ok(Instance {
            id: row.id,
            image_id: row.image_id,
            port,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgImageStore {
    pool: PgPool,
}

impl PgImageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageStore for PgImageStore {
    async fn list(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query_as::<_, ImageRow>(
            "SELECT id, backed_up_at, ready, created_at, updated_at FROM images ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Image::from).collect())
    }

    async fn get(&self, id: ImageId) -> Result<Image> {
        sqlx::query_as::<_, ImageRow>(
            "SELECT id, backed_up_at, ready, anon, created_at, updated_at FROM images WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Image::from)
        .ok_or(StoreError::NotFound { kind: "image", id })
    }

    async fn create(&self, image: NewImage) -> Result<Image> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, ImageRow>(
            "INSERT INTO images (backed_up_at, ready, anon, created_at, updated_at)
             VALUES ($1, FALSE, $2, $3, $3)
             RETURNING id, backed_up_at, ready, created_at, updated_at",
        )
        .bind(image.backed_up_at)
        .bind(&image.anon)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn mark_as_ready(&self, image: &Image) -> Result<Image> {
        let updated = sqlx::query_as::<_, ImageRow>(
            "UPDATE images
             SET ready = TRUE, updated_at = now()
             WHERE id = $1 AND ready = $2
             RETURNING id, backed_up_at, ready, created_at, updated_at",
        )
        .bind(image.id)
        .bind(image.ready)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(row.into());
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM images WHERE id = $1)")
            .bind(image.id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Err(StoreError::Stale {
                id: image.id,
                expected_ready: image.ready,
            })
        } else {
            Err(StoreError::NotFound {
                kind: "image",
                id: image.id,
            })
        }
    }

    async fn destroy(&self, image: &Image) -> Result<()> {
        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(image.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgInstanceStore {
    pool: PgPool,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn list(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, image_id, port, created_at, updated_at FROM instances ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    async fn get(&self, id: InstanceId) -> Result<Instance> {
        sqlx::query_as::<_, InstanceRow>(
            "SELECT id, image_id, port, created_at, updated_at FROM instances WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound {
            kind: "instance",
            id,
        })?
        .try_into()
    }

    async fn next_id(&self) -> Result<InstanceId> {
        let id: i64 =
            sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('instances', 'id'))")
                .fetch_one(&self.pool)
                .await?;
        Ok(id)
    }

    async fn create(&self, instance: NewInstance) -> Result<Instance> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, InstanceRow>(
            "INSERT INTO instances (id, image_id, port, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             RETURNING id, image_id, port, created_at, updated_at",
        )
        .bind(instance.id)
        .bind(instance.image_id)
        .bind(i32::from(instance.port))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Duplicate {
                kind: "instance",
                id: instance.id,
            },
            other => StoreError::Database(other),
        })?;
        row.try_into()
    }

    async fn destroy(&self, instance: &Instance) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(instance.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_for_image(&self, image_id: ImageId) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE image_id = $1")
            .bind(image_id)
            .fetch_one(&self.pool)
            .await?;
        usize::try_from(count).map_err(|_| StoreError::Corrupt(format!("instance count {count}")))
    }
}
