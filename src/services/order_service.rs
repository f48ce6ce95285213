use std::collections::HashMap;

use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::orders::{
        OrderItemDto, OrderList, OrderStats, OrderStatsSummary, OrderWithItems, OrderedProduct,
        StatusCount, UpdateOrderStatusRequest,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderStatus, PublicUser},
    response::{ApiResponse, Meta},
    routes::params::OrderListQuery,
};

/// One cart line as seen by the checkout transaction. The product side of the
/// join is nullable: a seller may have deleted the listing since it was added.
#[derive(FromRow)]
struct CheckoutLine {
    product_id: Uuid,
    quantity: i32,
    price: Option<Decimal>,
    owner_id: Option<Uuid>,
}

/// A line that passed every checkout precondition.
#[derive(Debug)]
struct ValidatedLine {
    product_id: Uuid,
    quantity: i32,
    price: Decimal,
}

/// Sum of price x quantity, rounded to two decimal places once at the end.
fn compute_total(lines: &[ValidatedLine]) -> Decimal {
    lines
        .iter()
        .map(|line| line.price * Decimal::from(line.quantity))
        .sum::<Decimal>()
        .round_dp(2)
}

/// Validates the whole cart before any write, per the checkout contract:
/// non-empty, every product still exists, none owned by the purchaser.
fn validate_cart(user: &AuthUser, lines: Vec<CheckoutLine>) -> AppResult<Vec<ValidatedLine>> {
    if lines.is_empty() {
        return Err(AppError::BadRequest(
            "Your cart is empty. Add some items before checkout.".into(),
        ));
    }

    let mut validated = Vec::with_capacity(lines.len());
    for line in lines {
        let (price, owner_id) = match (line.price, line.owner_id) {
            (Some(price), Some(owner_id)) => (price, owner_id),
            _ => {
                return Err(AppError::BadRequest(
                    "One or more products in your cart no longer exist".into(),
                ));
            }
        };

        // Ownership may have changed since add-to-cart, so this is re-checked
        // here and not only at cart time.
        if owner_id == user.user_id {
            return Err(AppError::BadRequest(
                "You cannot purchase your own products".into(),
            ));
        }

        validated.push(ValidatedLine {
            product_id: line.product_id,
            quantity: line.quantity,
            price,
        });
    }

    Ok(validated)
}

/// Converts the caller's cart into a pending order, all or nothing: the order
/// row, its item snapshots, and the cart delete commit together or not at all.
pub async fn checkout(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<OrderWithItems>> {
    let mut txn = pool.begin().await?;

    // Lock the cart rows so a concurrent checkout by the same user observes
    // either the full cart or, after this commits, an empty one.
    let lines = sqlx::query_as::<_, CheckoutLine>(
        r#"
        SELECT ci.product_id, ci.quantity, p.price, p.owner_id
        FROM cart_items ci
        LEFT JOIN products p ON p.id = ci.product_id
        WHERE ci.user_id = $1
        ORDER BY ci.created_at
        FOR UPDATE OF ci
        "#,
    )
    .bind(user.user_id)
    .fetch_all(&mut *txn)
    .await?;

    let validated = validate_cart(user, lines)?;
    let total = compute_total(&validated);

    let order: Order = sqlx::query_as(
        r#"
        INSERT INTO orders (id, user_id, total, status)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.user_id)
    .bind(total)
    .bind(OrderStatus::Pending.as_str())
    .fetch_one(&mut *txn)
    .await?;

    for line in &validated {
        sqlx::query(
            r#"
            INSERT INTO order_items (id, order_id, product_id, price_at_purchase, quantity)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order.id)
        .bind(line.product_id)
        .bind(line.price)
        .bind(line.quantity)
        .execute(&mut *txn)
        .await?;
    }

    sqlx::query("DELETE FROM cart_items WHERE user_id = $1")
        .bind(user.user_id)
        .execute(&mut *txn)
        .await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "total": order.total })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let items = load_order_items(pool, &[order.id])
        .await?
        .remove(&order.id)
        .unwrap_or_default();

    Ok(ApiResponse::success(
        "Order placed successfully",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

#[derive(FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    price_at_purchase: Decimal,
    quantity: i32,
    title: String,
    category: String,
    image_url: Option<String>,
    owner_id: Uuid,
    owner_username: String,
}

async fn load_order_items(
    pool: &DbPool,
    order_ids: &[Uuid],
) -> AppResult<HashMap<Uuid, Vec<OrderItemDto>>> {
    let rows = sqlx::query_as::<_, OrderItemRow>(
        r#"
        SELECT oi.id, oi.order_id, oi.product_id, oi.price_at_purchase, oi.quantity,
               p.title, p.category, p.image_url, p.owner_id, u.username AS owner_username
        FROM order_items oi
        JOIN products p ON p.id = oi.product_id
        JOIN users u ON u.id = p.owner_id
        WHERE oi.order_id = ANY($1)
        ORDER BY oi.created_at
        "#,
    )
    .bind(order_ids)
    .fetch_all(pool)
    .await?;

    let mut grouped: HashMap<Uuid, Vec<OrderItemDto>> = HashMap::new();
    for row in rows {
        grouped.entry(row.order_id).or_default().push(OrderItemDto {
            id: row.id,
            product_id: row.product_id,
            price_at_purchase: row.price_at_purchase,
            quantity: row.quantity,
            product: OrderedProduct {
                id: row.product_id,
                title: row.title,
                category: row.category,
                image_url: row.image_url,
                owner: PublicUser {
                    id: row.owner_id,
                    username: row.owner_username,
                },
            },
        });
    }

    Ok(grouped)
}

pub async fn list_orders(
    pool: &DbPool,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let status = match query.status.filter(|s| !s.is_empty()) {
        Some(status) => match OrderStatus::parse(&status) {
            Some(parsed) => parsed.as_str().to_string(),
            None => {
                return Err(AppError::BadRequest(
                    "Status must be one of: pending, confirmed, shipped, delivered, cancelled"
                        .into(),
                ));
            }
        },
        None => String::new(),
    };

    let orders: Vec<Order> = sqlx::query_as(
        r#"
        SELECT * FROM orders
        WHERE user_id = $1 AND ($2 = '' OR status = $2)
        ORDER BY created_at DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(user.user_id)
    .bind(&status)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let total: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM orders WHERE user_id = $1 AND ($2 = '' OR status = $2)",
    )
    .bind(user.user_id)
    .bind(&status)
    .fetch_one(pool)
    .await?;

    let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let mut grouped = load_order_items(pool, &ids).await?;

    let items = orders
        .into_iter()
        .map(|order| {
            let items = grouped.remove(&order.id).unwrap_or_default();
            OrderWithItems { order, items }
        })
        .collect();

    let meta = Meta::new(page, limit, total.0);
    Ok(ApiResponse::success("Ok", OrderList { items }, Some(meta)))
}

pub async fn get_order(
    pool: &DbPool,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order: Option<Order> =
        sqlx::query_as("SELECT * FROM orders WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user.user_id)
            .fetch_optional(pool)
            .await?;
    let order = match order {
        Some(o) => o,
        None => {
            return Err(AppError::NotFound(
                "The requested order does not exist".into(),
            ));
        }
    };

    let items = load_order_items(pool, &[order.id])
        .await?
        .remove(&order.id)
        .unwrap_or_default();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

/// Buyer-facing status surface: the only reachable transition is into
/// `cancelled`, and only while the order has not shipped.
pub async fn update_order_status(
    pool: &DbPool,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let requested = match OrderStatus::parse(&payload.status) {
        Some(status) => status,
        None => {
            return Err(AppError::BadRequest(
                "Status must be one of: pending, confirmed, shipped, delivered, cancelled".into(),
            ));
        }
    };

    let order: Option<Order> =
        sqlx::query_as("SELECT * FROM orders WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user.user_id)
            .fetch_optional(pool)
            .await?;
    let order = match order {
        Some(o) => o,
        None => {
            return Err(AppError::NotFound(
                "The requested order does not exist".into(),
            ));
        }
    };

    if requested != OrderStatus::Cancelled {
        return Err(AppError::Forbidden("You can only cancel orders".into()));
    }

    let current = OrderStatus::parse(&order.status)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown order status in store")))?;
    if !current.can_cancel() {
        return Err(AppError::Conflict(
            "Order has already been shipped and cannot be cancelled".into(),
        ));
    }

    // The status guard re-checks inside the UPDATE so a transition that lands
    // between the read above and this write cannot be cancelled over.
    let order: Option<Order> = sqlx::query_as(
        r#"
        UPDATE orders SET status = $3, updated_at = now()
        WHERE id = $1 AND user_id = $2 AND status NOT IN ('shipped', 'delivered')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(user.user_id)
    .bind(requested.as_str())
    .fetch_optional(pool)
    .await?;
    let order = match order {
        Some(o) => o,
        None => {
            return Err(AppError::Conflict(
                "Order has already been shipped and cannot be cancelled".into(),
            ));
        }
    };

    if let Err(err) = log_audit(
        pool,
        Some(user.user_id),
        "order_cancelled",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let items = load_order_items(pool, &[order.id])
        .await?
        .remove(&order.id)
        .unwrap_or_default();

    Ok(ApiResponse::success(
        "Order status updated successfully",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

pub async fn order_stats(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<OrderStats>> {
    let stats: Vec<StatusCount> = sqlx::query_as::<_, (String, i64, Decimal)>(
        r#"
        SELECT status, count(*), COALESCE(sum(total), 0)
        FROM orders
        WHERE user_id = $1
        GROUP BY status
        ORDER BY status
        "#,
    )
    .bind(user.user_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(status, count, total_amount)| StatusCount {
        status,
        count,
        total_amount,
    })
    .collect();

    let summary: (i64, Decimal) = sqlx::query_as(
        "SELECT count(*), COALESCE(sum(total), 0) FROM orders WHERE user_id = $1",
    )
    .bind(user.user_id)
    .fetch_one(pool)
    .await?;

    Ok(ApiResponse::success(
        "OK",
        OrderStats {
            stats,
            summary: OrderStatsSummary {
                total_orders: summary.0,
                total_spent: summary.1.round_dp(2),
            },
        },
        Some(Meta::empty()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
        }
    }

    fn line(price: Option<&str>, quantity: i32, owner_id: Option<Uuid>) -> CheckoutLine {
        CheckoutLine {
            product_id: Uuid::new_v4(),
            quantity,
            price: price.map(|p| p.parse().unwrap()),
            owner_id,
        }
    }

    #[test]
    fn total_is_rounded_once_at_the_end() {
        let lines = vec![
            ValidatedLine {
                product_id: Uuid::new_v4(),
                quantity: 2,
                price: "10.00".parse().unwrap(),
            },
            ValidatedLine {
                product_id: Uuid::new_v4(),
                quantity: 1,
                price: "5.50".parse().unwrap(),
            },
        ];
        assert_eq!(compute_total(&lines), "25.50".parse::<Decimal>().unwrap());

        let lines = vec![ValidatedLine {
            product_id: Uuid::new_v4(),
            quantity: 3,
            price: "19.99".parse().unwrap(),
        }];
        assert_eq!(compute_total(&lines), "59.97".parse::<Decimal>().unwrap());
    }

    #[test]
    fn empty_cart_is_rejected() {
        let err = validate_cart(&auth(), Vec::new()).unwrap_err();
        assert!(err.to_string().contains("cart is empty"));
    }

    #[test]
    fn missing_product_aborts_the_whole_cart() {
        let seller = Uuid::new_v4();
        let lines = vec![
            line(Some("10.00"), 1, Some(seller)),
            line(None, 2, None),
        ];
        let err = validate_cart(&auth(), lines).unwrap_err();
        assert!(err.to_string().contains("no longer exist"));
    }

    #[test]
    fn self_purchase_is_rejected_at_checkout() {
        let user = auth();
        let lines = vec![line(Some("10.00"), 1, Some(user.user_id))];
        let err = validate_cart(&user, lines).unwrap_err();
        assert!(err.to_string().contains("your own products"));
    }
}
