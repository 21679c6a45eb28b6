//! Content store seam and a SQLite-backed reference implementation.
//!
//! The replication protocol only talks to [`ContentStore`]; a CMS binding
//! would implement the same trait.

use crate::db::Pool;
use crate::model::{ContentItem, ItemDraft, PostStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

pub const CATEGORY: &str = "category";
pub const TAG: &str = "post_tag";

/// Image bytes downloaded for an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturedImage {
    pub source_url: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_item(&self, id: i64) -> Result<Option<ContentItem>>;

    async fn insert_item(&self, draft: &ItemDraft) -> Result<i64>;

    /// Returns `false` when no item with `id` exists.
    async fn update_item(&self, id: i64, draft: &ItemDraft) -> Result<bool>;

    /// Resolve each name (exact match), creating missing categories, and
    /// replace the item's categories with the result.
    async fn set_categories(&self, id: i64, names: &BTreeSet<String>) -> Result<()>;

    /// Replace the item's tag set.
    async fn set_tags(&self, id: i64, names: &BTreeSet<String>) -> Result<()>;

    async fn set_featured_image(&self, id: i64, image: &FeaturedImage) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteContentStore {
    pool: Pool,
    media_dir: PathBuf,
}

impl SqliteContentStore {
    pub fn new(pool: Pool, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            media_dir: media_dir.into(),
        }
    }

    /// Attach an already hosted image by URL, without a local copy.
    pub async fn set_featured_image_url(&self, id: i64, url: &str) -> Result<()> {
        let file_name = url.rsplit('/').next().unwrap_or(url).to_string();
        let mut tx = self.pool.begin().await?;
        let media_id: i64 = sqlx::query_scalar(
            "INSERT INTO media (source_url, file_name, local_path) VALUES (?, ?, '') RETURNING id",
        )
        .bind(url)
        .bind(&file_name)
        .fetch_one(&mut *tx)
        .await?;
        attach_media(&mut tx, id, media_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn link_media(&self, id: i64, image: &FeaturedImage, local_path: &Path) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let media_id: i64 = sqlx::query_scalar(
            "INSERT INTO media (source_url, file_name, local_path) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&image.source_url)
        .bind(&image.file_name)
        .bind(local_path.to_string_lossy().to_string())
        .fetch_one(&mut *tx)
        .await?;
        attach_media(&mut tx, id, media_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Update only the status column (used by the trigger source).
    pub async fn set_status(&self, id: i64, status: PostStatus) -> Result<()> {
        sqlx::query("UPDATE posts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_items(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn term_names(&self, id: i64, taxonomy: &str) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT t.name FROM terms t JOIN post_terms pt ON pt.term_id = t.id WHERE pt.post_id = ? AND t.taxonomy = ?",
        )
        .bind(id)
        .bind(taxonomy)
        .fetch_all(&self.pool)
        .await?;
        Ok(names.into_iter().collect())
    }

    async fn replace_terms(&self, id: i64, taxonomy: &str, names: &BTreeSet<String>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM post_terms WHERE post_id = ? AND term_id IN (SELECT id FROM terms WHERE taxonomy = ?)",
        )
        .bind(id)
        .bind(taxonomy)
        .execute(&mut *tx)
        .await?;
        for name in names.iter().filter(|n| !n.trim().is_empty()) {
            let term_id = get_or_create_term(&mut tx, taxonomy, name).await?;
            sqlx::query("INSERT OR IGNORE INTO post_terms (post_id, term_id) VALUES (?, ?)")
                .bind(id)
                .bind(term_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn get_or_create_term(
    tx: &mut Transaction<'_, Sqlite>,
    taxonomy: &str,
    name: &str,
) -> Result<i64> {
    // `=` uses the BINARY collation, so matching is case-sensitive.
    if let Some(id) =
        sqlx::query_scalar::<_, i64>("SELECT id FROM terms WHERE taxonomy = ? AND name = ?")
            .bind(taxonomy)
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?
    {
        return Ok(id);
    }
    debug!(taxonomy, name, "creating term");
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO terms (taxonomy, name) VALUES (?, ?) RETURNING id",
    )
    .bind(taxonomy)
    .bind(name)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

async fn attach_media(tx: &mut Transaction<'_, Sqlite>, post_id: i64, media_id: i64) -> Result<()> {
    let updated = sqlx::query("UPDATE posts SET featured_media_id = ? WHERE id = ?")
        .bind(media_id)
        .bind(post_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(anyhow!("item {} not found", post_id));
    }
    Ok(())
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    #[instrument(skip(self))]
    async fn get_item(&self, id: i64) -> Result<Option<ContentItem>> {
        let row = sqlx::query(
            "SELECT p.id, p.kind, p.status, p.title, p.content, p.excerpt, m.source_url \
             FROM posts p LEFT JOIN media m ON m.id = p.featured_media_id WHERE p.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("status");
        let status = PostStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("item {} has unknown status {}", id, status))?;
        Ok(Some(ContentItem {
            id: row.get("id"),
            kind: row.get("kind"),
            status,
            title: row.get("title"),
            content: row.get("content"),
            excerpt: row.get("excerpt"),
            categories: self.term_names(id, CATEGORY).await?,
            tags: self.term_names(id, TAG).await?,
            featured_image_url: row.get::<Option<String>, _>("source_url"),
        }))
    }

    #[instrument(skip_all)]
    async fn insert_item(&self, draft: &ItemDraft) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO posts (kind, status, title, content, excerpt, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&draft.kind)
        .bind(draft.status.as_str())
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(&draft.excerpt)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    #[instrument(skip(self, draft))]
    async fn update_item(&self, id: i64, draft: &ItemDraft) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE posts SET kind = ?, status = ?, title = ?, content = ?, excerpt = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&draft.kind)
        .bind(draft.status.as_str())
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(&draft.excerpt)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    #[instrument(skip(self, names))]
    async fn set_categories(&self, id: i64, names: &BTreeSet<String>) -> Result<()> {
        self.replace_terms(id, CATEGORY, names).await
    }

    #[instrument(skip(self, names))]
    async fn set_tags(&self, id: i64, names: &BTreeSet<String>) -> Result<()> {
        self.replace_terms(id, TAG, names).await
    }

    #[instrument(skip(self, image), fields(file = %image.file_name))]
    async fn set_featured_image(&self, id: i64, image: &FeaturedImage) -> Result<()> {
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .with_context(|| format!("failed to create media dir: {}", self.media_dir.display()))?;
        let local_path = self
            .media_dir
            .join(format!("{}-{}", uuid::Uuid::new_v4().simple(), image.file_name));
        tokio::fs::write(&local_path, &image.bytes)
            .await
            .with_context(|| format!("failed to write media file: {}", local_path.display()))?;

        if let Err(err) = self.link_media(id, image, &local_path).await {
            if let Err(rm) = tokio::fs::remove_file(&local_path).await {
                warn!(?rm, path = %local_path.display(), "failed to remove unlinked media file");
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn setup() -> (SqliteContentStore, tempfile::TempDir) {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        (SqliteContentStore::new(pool, dir.path().join("media")), dir)
    }

    fn draft(title: &str) -> ItemDraft {
        ItemDraft {
            kind: "post".into(),
            status: PostStatus::Publish,
            title: title.into(),
            content: "<p>body</p>".into(),
            excerpt: "".into(),
        }
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn insert_update_get_roundtrip() {
        let (store, _dir) = setup().await;
        let id = store.insert_item(&draft("Hello")).await.unwrap();
        assert!(store.update_item(id, &draft("Bonjour")).await.unwrap());
        assert!(!store.update_item(id + 100, &draft("x")).await.unwrap());

        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.title, "Bonjour");
        assert_eq!(item.status, PostStatus::Publish);
        assert!(item.featured_image_url.is_none());
        assert!(store.get_item(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_and_linked_image_url() {
        let (store, _dir) = setup().await;
        let id = store.insert_item(&draft("a")).await.unwrap();
        store.set_status(id, PostStatus::Trash).await.unwrap();
        store
            .set_featured_image_url(id, "https://h.example/img/dog.jpg")
            .await
            .unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.status, PostStatus::Trash);
        assert_eq!(item.featured_image_url.as_deref(), Some("https://h.example/img/dog.jpg"));
        assert_eq!(store.count_items().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn categories_match_case_sensitively_and_are_created_once() {
        let (store, _dir) = setup().await;
        let a = store.insert_item(&draft("a")).await.unwrap();
        let b = store.insert_item(&draft("b")).await.unwrap();
        store.set_categories(a, &names(&["News", "news"])).await.unwrap();
        store.set_categories(b, &names(&["News"])).await.unwrap();

        let terms: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM terms WHERE taxonomy = 'category'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(terms, 2);
        assert_eq!(store.get_item(a).await.unwrap().unwrap().categories, names(&["News", "news"]));
    }

    #[tokio::test]
    async fn tags_are_replaced() {
        let (store, _dir) = setup().await;
        let id = store.insert_item(&draft("a")).await.unwrap();
        store.set_categories(id, &names(&["Cat"])).await.unwrap();
        store.set_tags(id, &names(&["x", "y"])).await.unwrap();
        store.set_tags(id, &names(&["z"])).await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.tags, names(&["z"]));
        assert_eq!(item.categories, names(&["Cat"]));
    }

    #[tokio::test]
    async fn featured_image_is_written_and_linked() {
        let (store, dir) = setup().await;
        let id = store.insert_item(&draft("a")).await.unwrap();
        let image = FeaturedImage {
            source_url: "https://h.example/img/cat.png".into(),
            file_name: "cat.png".into(),
            bytes: vec![1, 2, 3],
        };
        store.set_featured_image(id, &image).await.unwrap();
        let item = store.get_item(id).await.unwrap().unwrap();
        assert_eq!(item.featured_image_url.as_deref(), Some("https://h.example/img/cat.png"));
        let files: Vec<_> = std::fs::read_dir(dir.path().join("media")).unwrap().collect();
        assert_eq!(files.len(), 1);

        assert!(store.set_featured_image(id + 1, &image).await.is_err());
        let files: Vec<_> = std::fs::read_dir(dir.path().join("media")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}
