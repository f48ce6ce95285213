use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use ecofinds_api::{config::AppConfig, db::create_pool};
use rust_decimal::Decimal;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    let alice = ensure_user(&pool, "alice", "alice@example.com", "password123").await?;
    let bob = ensure_user(&pool, "bob", "bob@example.com", "password123").await?;

    let listings: &[(&str, &str, &str, &str, Uuid)] = &[
        (
            "Vintage Denim Jacket",
            "Lightly worn denim jacket from the 90s, size M. No tears or stains.",
            "Clothing",
            "35.00",
            alice,
        ),
        (
            "Acoustic Guitar",
            "Second-hand dreadnought acoustic guitar with a soft case. Recently restrung.",
            "Music",
            "120.00",
            alice,
        ),
        (
            "Mid-century Coffee Table",
            "Solid teak coffee table, some surface scratches, very sturdy.",
            "Furniture",
            "85.50",
            bob,
        ),
        (
            "Paperback Novel Bundle",
            "Ten contemporary fiction paperbacks in good condition, sold together.",
            "Books",
            "18.00",
            bob,
        ),
    ];

    for (title, description, category, price, owner) in listings {
        seed_product(&pool, title, description, category, price.parse()?, *owner).await?;
    }

    println!("Seed completed. Users: alice={alice}, bob={bob}");
    Ok(())
}

async fn ensure_user(
    pool: &sqlx::PgPool,
    username: &str,
    email: &str,
    password: &str,
) -> anyhow::Result<Uuid> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .to_string();

    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO users (id, username, email, password_hash)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE SET username = EXCLUDED.username
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

async fn seed_product(
    pool: &sqlx::PgPool,
    title: &str,
    description: &str,
    category: &str,
    price: Decimal,
    owner_id: Uuid,
) -> anyhow::Result<()> {
    let exists: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM products WHERE title = $1 AND owner_id = $2")
            .bind(title)
            .bind(owner_id)
            .fetch_optional(pool)
            .await?;
    if exists.is_some() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO products (id, title, description, category, price, owner_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(title)
    .bind(description)
    .bind(category)
    .bind(price)
    .bind(owner_id)
    .execute(pool)
    .await?;

    Ok(())
}
