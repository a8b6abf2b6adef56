use anyhow::Result;
use sqlx::postgres::PgPool;

/// A product record in the external catalog. Read-only here except for
/// `image_url`, which is only ever written after a successful upload.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CatalogItem {
    pub id: i64,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub image_url: Option<String>,
    pub priority: Option<i32>,
}

/// Per-run view of a catalog item queued for acquisition. Created at run
/// start, discarded at run end.
#[derive(Debug, Clone)]
pub struct AcquisitionTarget {
    pub item_id: i64,
    pub brand: String,
    pub model: String,
    pub category: String,
    pub existing_image_url: Option<String>,
}

impl AcquisitionTarget {
    /// Search query used by template-based strategies.
    pub fn query(&self) -> String {
        format!("{} {} {}", self.brand, self.model, self.category)
    }

    /// Lookup key into direct-URL tables.
    pub fn lookup_key(&self) -> String {
        format!("{} {}", self.brand, self.model).to_lowercase()
    }

    /// Short label for logs and failure reports.
    pub fn label(&self) -> String {
        format!("#{} {} {}", self.item_id, self.brand, self.model)
    }
}

impl From<&CatalogItem> for AcquisitionTarget {
    fn from(item: &CatalogItem) -> Self {
        Self {
            item_id: item.id,
            brand: item.brand.clone(),
            model: item.model.clone(),
            category: item.category.clone(),
            existing_image_url: item.image_url.clone(),
        }
    }
}

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id BIGSERIAL PRIMARY KEY,
            brand VARCHAR NOT NULL,
            model VARCHAR NOT NULL,
            category VARCHAR NOT NULL,
            image_url TEXT,
            priority INT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Items still lacking an acceptable image, highest priority first,
/// catalog order breaking ties.
pub async fn list_items_missing_image(pool: &PgPool, limit: i64) -> Result<Vec<CatalogItem>> {
    let items = sqlx::query_as::<_, CatalogItem>(
        "SELECT id, brand, model, category, image_url, priority FROM products \
         WHERE image_url IS NULL OR image_url = '' \
         ORDER BY priority DESC NULLS LAST, id ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(items)
}

pub async fn update_image_reference(pool: &PgPool, item_id: i64, url: &str) -> Result<()> {
    sqlx::query("UPDATE products SET image_url = $1 WHERE id = $2")
        .bind(url)
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}
