use ecofinds_api::{
    db::{DbPool, create_pool},
    dto::{
        cart::{AddToCartRequest, UpdateCartItemRequest},
        orders::UpdateOrderStatusRequest,
        products::CreateProductRequest,
    },
    error::AppError,
    middleware::auth::AuthUser,
    services::{cart_service, order_service, product_service},
};
use rust_decimal::Decimal;
use uuid::Uuid;

// Integration flow against a live Postgres: cart mutation rules, the checkout
// transaction, and the order status machine. Covers the walk-through
// scenarios: a valid two-line checkout, a deleted product aborting checkout,
// self-purchase rejection, the quantity cap, and concurrent checkouts.
#[tokio::test]
async fn cart_to_order_flow() -> anyhow::Result<()> {
    // Allow skipping when no DB is configured in the environment.
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
            );
            return Ok(());
        }
    };

    let pool = setup_pool(&database_url).await?;

    let seller = create_user(&pool, "seller", "seller@example.com").await?;
    let buyer = create_user(&pool, "buyer", "buyer@example.com").await?;

    let jacket = create_product(&pool, &seller, "Vintage Denim Jacket", "10.00").await?;
    let novel = create_product(&pool, &seller, "Paperback Novel Bundle", "5.50").await?;
    let own_listing = create_product(&pool, &buyer, "Buyer Owned Lamp", "20.00").await?;

    // Self-purchase is blocked at add-to-cart.
    let result = cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: own_listing,
            quantity: 1,
        },
    )
    .await;
    assert_bad_request(result.err(), "your own products");
    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert!(cart.items.is_empty(), "rejected add must not create a line");

    // Empty cart cannot be checked out.
    assert_bad_request(
        order_service::checkout(&pool, &buyer).await.err(),
        "cart is empty",
    );

    // Re-adding the same product increments instead of duplicating.
    cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: jacket,
            quantity: 1,
        },
    )
    .await?;
    cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: jacket,
            quantity: 1,
        },
    )
    .await?;
    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].quantity, 2);

    // Two concurrent adds of the same product merge into one line instead of
    // one of them tripping the unique constraint.
    let (first_add, second_add) = tokio::join!(
        cart_service::add_to_cart(
            &pool,
            &buyer,
            AddToCartRequest {
                product_id: novel,
                quantity: 1,
            },
        ),
        cart_service::add_to_cart(
            &pool,
            &buyer,
            AddToCartRequest {
                product_id: novel,
                quantity: 1,
            },
        ),
    );
    first_add?;
    second_add?;
    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    let novel_line = cart
        .items
        .iter()
        .find(|line| line.product.as_ref().map(|p| p.id) == Some(novel))
        .unwrap();
    assert_eq!(novel_line.quantity, 2);
    cart_service::remove_from_cart(&pool, &buyer, novel_line.id).await?;

    // An increment past 99 is rejected and leaves the quantity unchanged.
    let line_id = cart.items[0].id;
    cart_service::update_cart_item(
        &pool,
        &buyer,
        line_id,
        UpdateCartItemRequest { quantity: 60 },
    )
    .await?;
    let result = cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: jacket,
            quantity: 60,
        },
    )
    .await;
    assert_bad_request(result.err(), "Maximum quantity");
    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert_eq!(cart.items[0].quantity, 60);

    // Direct updates outside [1, 99] are rejected too.
    assert_bad_request(
        cart_service::update_cart_item(
            &pool,
            &buyer,
            line_id,
            UpdateCartItemRequest { quantity: 100 },
        )
        .await
        .err(),
        "between 1 and 99",
    );

    // Scenario A: two lines, total 2 x 10.00 + 1 x 5.50 = 25.50.
    cart_service::update_cart_item(&pool, &buyer, line_id, UpdateCartItemRequest { quantity: 2 })
        .await?;
    cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: novel,
            quantity: 1,
        },
    )
    .await?;

    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert_eq!(cart.summary.item_count, 3);
    assert_eq!(cart.summary.total, dec("25.50"));

    let placed = order_service::checkout(&pool, &buyer).await?.data.unwrap();
    assert_eq!(placed.order.status, "pending");
    assert_eq!(placed.order.total, dec("25.50"));
    assert_eq!(placed.items.len(), 2);
    let item_sum: Decimal = placed
        .items
        .iter()
        .map(|item| item.price_at_purchase * Decimal::from(item.quantity))
        .sum();
    assert_eq!(item_sum.round_dp(2), placed.order.total);

    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert!(cart.items.is_empty(), "checkout must empty the cart");

    // Price snapshot: raising the listing price does not touch history.
    sqlx::query("UPDATE products SET price = $2 WHERE id = $1")
        .bind(jacket)
        .bind(dec("999.99"))
        .execute(&pool)
        .await?;
    let fetched = order_service::get_order(&pool, &buyer, placed.order.id)
        .await?
        .data
        .unwrap();
    let jacket_line = fetched
        .items
        .iter()
        .find(|item| item.product_id == jacket)
        .unwrap();
    assert_eq!(jacket_line.price_at_purchase, dec("10.00"));

    // A product sold in an order cannot be deleted.
    let result = product_service::delete_product(&pool, &seller, jacket).await;
    assert!(
        matches!(result, Err(AppError::Conflict(_))),
        "expected Conflict deleting an ordered product"
    );

    // Scenario B: a deleted product aborts checkout and leaves the cart as-is.
    let doomed = create_product(&pool, &seller, "Soon Deleted Poster", "3.25").await?;
    cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: doomed,
            quantity: 1,
        },
    )
    .await?;
    product_service::delete_product(&pool, &seller, doomed).await?;

    assert_bad_request(
        order_service::checkout(&pool, &buyer).await.err(),
        "no longer exist",
    );
    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert_eq!(cart.items.len(), 1, "failed checkout must not touch the cart");
    assert!(cart.items[0].product.is_none(), "product is gone, line remains");

    let orders = order_service::list_orders(
        &pool,
        &buyer,
        ecofinds_api::routes::params::OrderListQuery {
            pagination: ecofinds_api::routes::params::Pagination {
                page: None,
                per_page: None,
            },
            status: None,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(orders.items.len(), 1, "failed checkout must not create orders");

    let cleared = cart_service::clear_cart(&pool, &buyer).await?.data.unwrap();
    assert_eq!(cleared.deleted_items, 1);

    // Cancellation: allowed while pending, refused once shipped.
    let cancelled = order_service::update_order_status(
        &pool,
        &buyer,
        placed.order.id,
        UpdateOrderStatusRequest {
            status: "cancelled".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(cancelled.order.status, "cancelled");

    sqlx::query("UPDATE orders SET status = 'shipped' WHERE id = $1")
        .bind(placed.order.id)
        .execute(&pool)
        .await?;
    let result = order_service::update_order_status(
        &pool,
        &buyer,
        placed.order.id,
        UpdateOrderStatusRequest {
            status: "cancelled".into(),
        },
    )
    .await;
    assert!(
        matches!(result, Err(AppError::Conflict(_))),
        "expected Conflict cancelling a shipped order"
    );

    // Buyers may not move orders anywhere but cancelled.
    let result = order_service::update_order_status(
        &pool,
        &buyer,
        placed.order.id,
        UpdateOrderStatusRequest {
            status: "delivered".into(),
        },
    )
    .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    // Scenario D: two concurrent checkouts of the same cart produce exactly
    // one order; the loser observes an empty cart.
    cart_service::add_to_cart(
        &pool,
        &buyer,
        AddToCartRequest {
            product_id: novel,
            quantity: 2,
        },
    )
    .await?;
    let (first, second) = tokio::join!(
        order_service::checkout(&pool, &buyer),
        order_service::checkout(&pool, &buyer),
    );
    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one concurrent checkout must win");
    for result in [first, second] {
        if let Err(err) = result {
            assert_bad_request(Some(err), "cart is empty");
        }
    }
    let cart = cart_service::get_cart(&pool, &buyer).await?.data.unwrap();
    assert!(cart.items.is_empty());

    Ok(())
}

fn dec(value: &str) -> Decimal {
    value.parse().unwrap()
}

fn assert_bad_request(err: Option<AppError>, needle: &str) {
    match err {
        Some(AppError::BadRequest(msg)) => {
            assert!(msg.contains(needle), "unexpected message: {msg}")
        }
        other => panic!("expected BadRequest containing {needle:?}, got {other:?}"),
    }
}

async fn setup_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = create_pool(database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    // Clean tables between runs.
    sqlx::query(
        "TRUNCATE TABLE order_items, orders, cart_items, audit_logs, products, users RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

async fn create_user(pool: &DbPool, username: &str, email: &str) -> anyhow::Result<AuthUser> {
    let row: (Uuid,) = sqlx::query_as(
        "INSERT INTO users (id, username, email, password_hash) VALUES ($1, $2, $3, 'dummy') RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(email)
    .fetch_one(pool)
    .await?;

    Ok(AuthUser { user_id: row.0 })
}

async fn create_product(
    pool: &DbPool,
    owner: &AuthUser,
    title: &str,
    price: &str,
) -> anyhow::Result<Uuid> {
    let created = product_service::create_product(
        pool,
        owner,
        CreateProductRequest {
            title: title.into(),
            description: "A second-hand item listed for the integration flow.".into(),
            category: "Other".into(),
            price: dec(price),
            image_url: None,
        },
    )
    .await?;

    Ok(created.data.unwrap().id)
}
