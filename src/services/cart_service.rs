use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::cart::{
        AddToCartRequest, CartCount, CartLineDto, CartProduct, CartSummary, CartView,
        ClearCartResponse, UpdateCartItemRequest,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::PublicUser,
    response::{ApiResponse, Meta},
};

pub const MAX_QUANTITY: i32 = 99;

#[derive(FromRow)]
struct CartLineRow {
    id: Uuid,
    quantity: i32,
    created_at: DateTime<Utc>,
    product_id: Option<Uuid>,
    title: Option<String>,
    category: Option<String>,
    price: Option<Decimal>,
    image_url: Option<String>,
    owner_id: Option<Uuid>,
    owner_username: Option<String>,
}

impl From<CartLineRow> for CartLineDto {
    fn from(row: CartLineRow) -> Self {
        let product = match (
            row.product_id,
            row.title,
            row.category,
            row.price,
            row.owner_id,
            row.owner_username,
        ) {
            (Some(id), Some(title), Some(category), Some(price), Some(owner_id), Some(username)) => {
                Some(CartProduct {
                    id,
                    title,
                    category,
                    price,
                    image_url: row.image_url,
                    owner: PublicUser {
                        id: owner_id,
                        username,
                    },
                })
            }
            _ => None,
        };
        CartLineDto {
            id: row.id,
            quantity: row.quantity,
            product,
            created_at: row.created_at,
        }
    }
}

const CART_LINE_SELECT: &str = r#"
    SELECT ci.id, ci.quantity, ci.created_at,
           p.id AS product_id, p.title, p.category, p.price, p.image_url,
           p.owner_id, u.username AS owner_username
    FROM cart_items ci
    LEFT JOIN products p ON p.id = ci.product_id
    LEFT JOIN users u ON u.id = p.owner_id
"#;

fn validate_quantity(quantity: i32) -> AppResult<()> {
    if !(1..=MAX_QUANTITY).contains(&quantity) {
        return Err(AppError::BadRequest(
            "Quantity must be between 1 and 99".into(),
        ));
    }
    Ok(())
}

fn summarize(lines: &[CartLineDto]) -> CartSummary {
    let item_count = lines.iter().map(|line| i64::from(line.quantity)).sum();
    let total = lines
        .iter()
        .filter_map(|line| {
            line.product
                .as_ref()
                .map(|p| p.price * Decimal::from(line.quantity))
        })
        .sum::<Decimal>()
        .round_dp(2);
    CartSummary { item_count, total }
}

async fn load_line(pool: &DbPool, user: &AuthUser, line_id: Uuid) -> AppResult<CartLineDto> {
    let sql = format!("{CART_LINE_SELECT} WHERE ci.id = $1 AND ci.user_id = $2");
    let row = sqlx::query_as::<_, CartLineRow>(&sql)
        .bind(line_id)
        .bind(user.user_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(CartLineDto::from(row)),
        None => Err(AppError::NotFound(
            "The requested cart item does not exist".into(),
        )),
    }
}

pub async fn get_cart(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<CartView>> {
    let sql = format!("{CART_LINE_SELECT} WHERE ci.user_id = $1 ORDER BY ci.created_at DESC");
    let rows = sqlx::query_as::<_, CartLineRow>(&sql)
        .bind(user.user_id)
        .fetch_all(pool)
        .await?;

    let items: Vec<CartLineDto> = rows.into_iter().map(CartLineDto::from).collect();
    let summary = summarize(&items);

    Ok(ApiResponse::success(
        "OK",
        CartView { items, summary },
        Some(Meta::empty()),
    ))
}

pub async fn cart_count(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<CartCount>> {
    let count: (Option<i64>,) =
        sqlx::query_as("SELECT sum(quantity)::bigint FROM cart_items WHERE user_id = $1")
            .bind(user.user_id)
            .fetch_one(pool)
            .await?;

    Ok(ApiResponse::success(
        "OK",
        CartCount {
            item_count: count.0.unwrap_or(0),
        },
        None,
    ))
}

pub async fn add_to_cart(
    pool: &DbPool,
    user: &AuthUser,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<CartLineDto>> {
    validate_quantity(payload.quantity)?;

    let product: Option<(Uuid,)> = sqlx::query_as("SELECT owner_id FROM products WHERE id = $1")
        .bind(payload.product_id)
        .fetch_optional(pool)
        .await?;
    let owner_id = match product {
        Some((owner_id,)) => owner_id,
        None => {
            return Err(AppError::NotFound(
                "The requested product does not exist".into(),
            ));
        }
    };

    if owner_id == user.user_id {
        return Err(AppError::BadRequest(
            "You cannot add your own products to cart".into(),
        ));
    }

    // Re-adding increments, atomically: the upsert absorbs a concurrent add of
    // the same product instead of tripping the unique constraint. A bump past
    // the cap matches no row, so the existing quantity survives a rejection.
    let upserted: Option<(Uuid, i32)> = sqlx::query_as(
        r#"
        INSERT INTO cart_items (id, user_id, product_id, quantity)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id, product_id) DO UPDATE
        SET quantity = cart_items.quantity + EXCLUDED.quantity
        WHERE cart_items.quantity + EXCLUDED.quantity <= $5
        RETURNING id, quantity
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.user_id)
    .bind(payload.product_id)
    .bind(payload.quantity)
    .bind(MAX_QUANTITY)
    .fetch_optional(pool)
    .await?;

    let (line_id, message) = match upserted {
        Some((line_id, quantity)) if quantity > payload.quantity => {
            (line_id, "Cart item updated successfully")
        }
        Some((line_id, _)) => (line_id, "Item added to cart successfully"),
        None => {
            return Err(AppError::BadRequest(
                "Maximum quantity per item is 99".into(),
            ));
        }
    };

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_add",
        Some("cart_items"),
        Some(serde_json::json!({
            "product_id": payload.product_id,
            "quantity": payload.quantity,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let line = load_line(pool, user, line_id).await?;
    Ok(ApiResponse::success(message, line, None))
}

pub async fn update_cart_item(
    pool: &DbPool,
    user: &AuthUser,
    line_id: Uuid,
    payload: UpdateCartItemRequest,
) -> AppResult<ApiResponse<CartLineDto>> {
    validate_quantity(payload.quantity)?;

    let result = sqlx::query("UPDATE cart_items SET quantity = $3 WHERE id = $1 AND user_id = $2")
        .bind(line_id)
        .bind(user.user_id)
        .bind(payload.quantity)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(
            "The requested cart item does not exist".into(),
        ));
    }

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_update",
        Some("cart_items"),
        Some(serde_json::json!({ "cart_item_id": line_id, "quantity": payload.quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let line = load_line(pool, user, line_id).await?;
    Ok(ApiResponse::success("Cart item updated successfully", line, None))
}

pub async fn remove_from_cart(
    pool: &DbPool,
    user: &AuthUser,
    line_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let result = sqlx::query("DELETE FROM cart_items WHERE id = $1 AND user_id = $2")
        .bind(line_id)
        .bind(user.user_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(
            "The requested cart item does not exist".into(),
        ));
    }

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_remove",
        Some("cart_items"),
        Some(serde_json::json!({ "cart_item_id": line_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Item removed from cart successfully",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn clear_cart(
    pool: &DbPool,
    user: &AuthUser,
) -> AppResult<ApiResponse<ClearCartResponse>> {
    let result = sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
        .bind(user.user_id)
        .execute(pool)
        .await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "cart_clear",
        Some("cart_items"),
        Some(serde_json::json!({ "deleted_items": result.rows_affected() })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Cart cleared successfully",
        ClearCartResponse {
            deleted_items: result.rows_affected(),
        },
        Some(Meta::empty()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(quantity: i32, price: Option<&str>) -> CartLineDto {
        CartLineDto {
            id: Uuid::new_v4(),
            quantity,
            product: price.map(|p| CartProduct {
                id: Uuid::new_v4(),
                title: "item".into(),
                category: "Other".into(),
                price: p.parse().unwrap(),
                image_url: None,
                owner: PublicUser {
                    id: Uuid::new_v4(),
                    username: "seller".into(),
                },
            }),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summary_totals_price_times_quantity() {
        let lines = vec![line(2, Some("10.00")), line(1, Some("5.50"))];
        let summary = summarize(&lines);
        assert_eq!(summary.item_count, 3);
        assert_eq!(summary.total, "25.50".parse::<Decimal>().unwrap());
    }

    #[test]
    fn summary_skips_dangling_lines() {
        let lines = vec![line(2, Some("10.00")), line(4, None)];
        let summary = summarize(&lines);
        assert_eq!(summary.item_count, 6);
        assert_eq!(summary.total, "20.00".parse::<Decimal>().unwrap());
    }

    #[test]
    fn quantity_bounds() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(99).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(100).is_err());
        assert!(validate_quantity(-3).is_err());
    }
}
