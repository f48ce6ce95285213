use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::products::{CreateProductRequest, ProductDto, ProductList, UpdateProductRequest},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{PublicUser, is_valid_category},
    response::{ApiResponse, Meta},
    routes::params::{Pagination, ProductQuery, ProductSortBy, SortOrder},
};

#[derive(FromRow)]
struct ProductOwnerRow {
    id: Uuid,
    title: String,
    description: String,
    category: String,
    price: Decimal,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    owner_id: Uuid,
    owner_username: String,
}

impl From<ProductOwnerRow> for ProductDto {
    fn from(row: ProductOwnerRow) -> Self {
        ProductDto {
            id: row.id,
            title: row.title,
            description: row.description,
            category: row.category,
            price: row.price,
            image_url: row.image_url,
            owner: PublicUser {
                id: row.owner_id,
                username: row.owner_username,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn validate_title(title: &str) -> AppResult<()> {
    let len = title.chars().count();
    if !(3..=100).contains(&len) {
        return Err(AppError::BadRequest(
            "Title must be between 3 and 100 characters long".into(),
        ));
    }
    Ok(())
}

fn validate_description(description: &str) -> AppResult<()> {
    let len = description.chars().count();
    if !(10..=1000).contains(&len) {
        return Err(AppError::BadRequest(
            "Description must be between 10 and 1000 characters long".into(),
        ));
    }
    Ok(())
}

fn validate_category(category: &str) -> AppResult<()> {
    if !is_valid_category(category) {
        return Err(AppError::BadRequest(format!(
            "Category must be one of: {}",
            crate::models::CATEGORIES.join(", ")
        )));
    }
    Ok(())
}

fn validate_price(price: Decimal) -> AppResult<()> {
    if price <= Decimal::ZERO {
        return Err(AppError::BadRequest("Price must be a positive number".into()));
    }
    if price.round_dp(2) != price {
        return Err(AppError::BadRequest(
            "Price can have at most 2 decimal places".into(),
        ));
    }
    Ok(())
}

fn validate_image_url(url: &str) -> AppResult<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(AppError::BadRequest("Image URL must be a valid URL".into()));
    }
    if url.chars().count() > 500 {
        return Err(AppError::BadRequest(
            "Image URL must be less than 500 characters long".into(),
        ));
    }
    Ok(())
}

/// Empty string clears the image; otherwise the URL is validated.
fn normalize_image_url(url: Option<String>) -> AppResult<Option<String>> {
    match url {
        None => Ok(None),
        Some(url) => {
            let url = url.trim().to_string();
            if url.is_empty() {
                return Ok(None);
            }
            validate_image_url(&url)?;
            Ok(Some(url))
        }
    }
}

pub async fn list_products(
    pool: &DbPool,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let search = query.q.unwrap_or_default();
    let category = query
        .category
        .filter(|c| !c.is_empty() && c != "All")
        .unwrap_or_default();

    let sort_by = query.sort_by.unwrap_or(ProductSortBy::CreatedAt);
    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    // Sort fragments come from closed enums, never from user input.
    let sql = format!(
        r#"
        SELECT p.id, p.title, p.description, p.category, p.price, p.image_url,
               p.created_at, p.updated_at, p.owner_id, u.username AS owner_username
        FROM products p
        JOIN users u ON u.id = p.owner_id
        WHERE ($1 = '' OR p.title ILIKE '%' || $1 || '%' OR p.description ILIKE '%' || $1 || '%')
          AND ($2 = '' OR p.category = $2)
        ORDER BY p.{} {}
        LIMIT $3 OFFSET $4
        "#,
        sort_by.as_sql(),
        sort_order.as_sql(),
    );

    let rows = sqlx::query_as::<_, ProductOwnerRow>(&sql)
        .bind(&search)
        .bind(&category)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    let total: (i64,) = sqlx::query_as(
        r#"
        SELECT count(*) FROM products p
        WHERE ($1 = '' OR p.title ILIKE '%' || $1 || '%' OR p.description ILIKE '%' || $1 || '%')
          AND ($2 = '' OR p.category = $2)
        "#,
    )
    .bind(&search)
    .bind(&category)
    .fetch_one(pool)
    .await?;

    let items = rows.into_iter().map(ProductDto::from).collect();
    let meta = Meta::new(page, limit, total.0);
    Ok(ApiResponse::success("Products", ProductList { items }, Some(meta)))
}

pub async fn my_products(
    pool: &DbPool,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<ProductList>> {
    let (page, limit, offset) = pagination.normalize();

    let rows = sqlx::query_as::<_, ProductOwnerRow>(
        r#"
        SELECT p.id, p.title, p.description, p.category, p.price, p.image_url,
               p.created_at, p.updated_at, p.owner_id, u.username AS owner_username
        FROM products p
        JOIN users u ON u.id = p.owner_id
        WHERE p.owner_id = $1
        ORDER BY p.created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user.user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: (i64,) = sqlx::query_as("SELECT count(*) FROM products WHERE owner_id = $1")
        .bind(user.user_id)
        .fetch_one(pool)
        .await?;

    let items = rows.into_iter().map(ProductDto::from).collect();
    let meta = Meta::new(page, limit, total.0);
    Ok(ApiResponse::success("My listings", ProductList { items }, Some(meta)))
}

pub async fn get_product(pool: &DbPool, id: Uuid) -> AppResult<ApiResponse<ProductDto>> {
    let row = sqlx::query_as::<_, ProductOwnerRow>(
        r#"
        SELECT p.id, p.title, p.description, p.category, p.price, p.image_url,
               p.created_at, p.updated_at, p.owner_id, u.username AS owner_username
        FROM products p
        JOIN users u ON u.id = p.owner_id
        WHERE p.id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(ApiResponse::success("Product", ProductDto::from(row), None)),
        None => Err(AppError::NotFound(
            "The requested product does not exist".into(),
        )),
    }
}

pub async fn create_product(
    pool: &DbPool,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<ProductDto>> {
    let title = payload.title.trim().to_string();
    let description = payload.description.trim().to_string();

    validate_title(&title)?;
    validate_description(&description)?;
    validate_category(&payload.category)?;
    validate_price(payload.price)?;
    let image_url = normalize_image_url(payload.image_url)?;

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO products (id, title, description, category, price, image_url, owner_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(&title)
    .bind(&description)
    .bind(&payload.category)
    .bind(payload.price)
    .bind(&image_url)
    .bind(user.user_id)
    .execute(pool)
    .await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "product_create",
        Some("products"),
        Some(serde_json::json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let created = get_product(pool, id).await?.data.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("created product not found on reload"))
    })?;
    Ok(ApiResponse::success(
        "Product created successfully",
        created,
        Some(Meta::empty()),
    ))
}

pub async fn update_product(
    pool: &DbPool,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<ProductDto>> {
    let existing: Option<crate::models::Product> =
        sqlx::query_as("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    let existing = match existing {
        Some(p) => p,
        None => {
            return Err(AppError::NotFound(
                "The requested product does not exist".into(),
            ));
        }
    };

    if existing.owner_id != user.user_id {
        return Err(AppError::Forbidden(
            "You can only update your own products".into(),
        ));
    }

    let title = match payload.title {
        Some(title) => {
            let title = title.trim().to_string();
            validate_title(&title)?;
            title
        }
        None => existing.title,
    };
    let description = match payload.description {
        Some(description) => {
            let description = description.trim().to_string();
            validate_description(&description)?;
            description
        }
        None => existing.description,
    };
    let category = match payload.category {
        Some(category) => {
            validate_category(&category)?;
            category
        }
        None => existing.category,
    };
    let price = match payload.price {
        Some(price) => {
            validate_price(price)?;
            price
        }
        None => existing.price,
    };
    let image_url = match payload.image_url {
        Some(url) => normalize_image_url(Some(url))?,
        None => existing.image_url,
    };

    sqlx::query(
        r#"
        UPDATE products
        SET title = $2, description = $3, category = $4, price = $5, image_url = $6,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&title)
    .bind(&description)
    .bind(&category)
    .bind(price)
    .bind(&image_url)
    .execute(pool)
    .await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "product_update",
        Some("products"),
        Some(serde_json::json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let updated = get_product(pool, id).await?.data.ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("updated product not found on reload"))
    })?;
    Ok(ApiResponse::success(
        "Product updated successfully",
        updated,
        Some(Meta::empty()),
    ))
}

pub async fn delete_product(
    pool: &DbPool,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let owner: Option<(Uuid,)> = sqlx::query_as("SELECT owner_id FROM products WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let owner = match owner {
        Some((owner_id,)) => owner_id,
        None => {
            return Err(AppError::NotFound(
                "The requested product does not exist".into(),
            ));
        }
    };

    if owner != user.user_id {
        return Err(AppError::Forbidden(
            "You can only delete your own products".into(),
        ));
    }

    let result = sqlx::query("DELETE FROM products WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await;

    match result {
        Ok(_) => {}
        // order_items restrict-on-delete: sold products stay in history.
        Err(sqlx::Error::Database(db))
            if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation) =>
        {
            return Err(AppError::Conflict(
                "This product is referenced in existing orders and cannot be deleted".into(),
            ));
        }
        Err(err) => return Err(err.into()),
    }

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "product_delete",
        Some("products"),
        Some(serde_json::json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Product deleted successfully",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_must_be_positive_with_two_decimals() {
        assert!(validate_price(Decimal::new(1050, 2)).is_ok());
        assert!(validate_price(Decimal::ZERO).is_err());
        assert!(validate_price(Decimal::new(-100, 2)).is_err());
        assert!(validate_price(Decimal::new(10501, 3)).is_err());
    }

    #[test]
    fn image_url_scheme_is_enforced() {
        assert!(normalize_image_url(Some("https://img.example/x.png".into())).is_ok());
        assert!(normalize_image_url(Some("ftp://img.example/x.png".into())).is_err());
        assert_eq!(normalize_image_url(Some("  ".into())).unwrap(), None);
        assert_eq!(normalize_image_url(None).unwrap(), None);
    }
}
