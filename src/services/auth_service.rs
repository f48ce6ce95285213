use argon2::{
    Argon2, PasswordHasher,
    password_hash::{PasswordHash, PasswordVerifier, SaltString},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use password_hash::rand_core::OsRng;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::auth::{AuthResponse, Claims, LoginRequest, RegisterRequest, UpdateProfileRequest},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::User,
    response::{ApiResponse, Meta},
};

fn validate_username(username: &str) -> AppResult<()> {
    let len = username.chars().count();
    if !(3..=30).contains(&len) {
        return Err(AppError::BadRequest(
            "Username must be between 3 and 30 characters long".into(),
        ));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::BadRequest(
            "Username must contain only letters and numbers".into(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> AppResult<()> {
    let valid = email.split_once('@').is_some_and(|(local, domain)| {
        !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
    });
    if !valid {
        return Err(AppError::BadRequest(
            "Please provide a valid email address".into(),
        ));
    }
    Ok(())
}

fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?
        .to_string();
    Ok(hash)
}

fn issue_token(user_id: Uuid) -> AppResult<String> {
    let secret = std::env::var("JWT_SECRET")
        .map_err(|_| AppError::Internal(anyhow::anyhow!("JWT_SECRET is not set")))?;

    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(24))
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to set expiration")))?;

    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))
}

pub async fn register_user(
    pool: &DbPool,
    payload: RegisterRequest,
) -> AppResult<ApiResponse<AuthResponse>> {
    let username = payload.username.trim().to_string();
    let email = payload.email.trim().to_lowercase();

    validate_username(&username)?;
    validate_email(&email)?;
    if payload.password.len() < 6 {
        return Err(AppError::BadRequest(
            "Password must be at least 6 characters long".into(),
        ));
    }

    let exist: Option<User> = sqlx::query_as(
        "SELECT * FROM users WHERE lower(email) = $1 OR lower(username) = lower($2)",
    )
    .bind(&email)
    .bind(&username)
    .fetch_optional(pool)
    .await?;

    if let Some(existing) = exist {
        let message = if existing.email.to_lowercase() == email {
            "Email already registered"
        } else {
            "Username already taken"
        };
        return Err(AppError::BadRequest(message.into()));
    }

    let password_hash = hash_password(&payload.password)?;
    let id = Uuid::new_v4();

    let user: User = sqlx::query_as(
        "INSERT INTO users (id, username, email, password_hash) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(id)
    .bind(&username)
    .bind(&email)
    .bind(password_hash)
    .fetch_one(pool)
    .await?;

    let token = issue_token(user.id)?;

    if let Err(err) = log_audit(
        pool,
        Some(user.id),
        "user_register",
        Some("users"),
        Some(serde_json::json!({ "user_id": user.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "User registered successfully",
        AuthResponse { user, token },
        None,
    ))
}

pub async fn login_user(
    pool: &DbPool,
    payload: LoginRequest,
) -> AppResult<ApiResponse<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE lower(email) = $1")
        .bind(&email)
        .fetch_optional(pool)
        .await?;

    // Unknown email and wrong password must be indistinguishable.
    let user = match user {
        Some(u) => u,
        None => return Err(AppError::Unauthorized("Invalid email or password".into())),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Invalid password hash")))?;

    let argon2 = Argon2::default();
    if argon2
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        return Err(AppError::Unauthorized("Invalid email or password".into()));
    }

    let token = issue_token(user.id)?;

    if let Err(err) = log_audit(
        pool,
        Some(user.id),
        "user_login",
        Some("users"),
        Some(serde_json::json!({ "user_id": user.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Login successful",
        AuthResponse { user, token },
        Some(Meta::empty()),
    ))
}

pub async fn get_profile(pool: &DbPool, auth: &AuthUser) -> AppResult<ApiResponse<User>> {
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(auth.user_id)
        .fetch_optional(pool)
        .await?;

    match user {
        Some(user) => Ok(ApiResponse::success("OK", user, None)),
        None => Err(AppError::Unauthorized("User not found".into())),
    }
}

pub async fn update_profile(
    pool: &DbPool,
    auth: &AuthUser,
    payload: UpdateProfileRequest,
) -> AppResult<ApiResponse<User>> {
    let existing: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = $1")
        .bind(auth.user_id)
        .fetch_optional(pool)
        .await?;
    let existing = match existing {
        Some(u) => u,
        None => return Err(AppError::Unauthorized("User not found".into())),
    };

    let username = match payload.username {
        Some(username) => {
            let username = username.trim().to_string();
            validate_username(&username)?;
            username
        }
        None => existing.username,
    };
    let email = match payload.email {
        Some(email) => {
            let email = email.trim().to_lowercase();
            validate_email(&email)?;
            email
        }
        None => existing.email,
    };

    let taken: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM users WHERE (lower(email) = $1 OR lower(username) = lower($2)) AND id <> $3",
    )
    .bind(&email)
    .bind(&username)
    .bind(auth.user_id)
    .fetch_optional(pool)
    .await?;
    if taken.is_some() {
        return Err(AppError::BadRequest(
            "Email or username already in use".into(),
        ));
    }

    let user: User = sqlx::query_as(
        r#"
        UPDATE users
        SET username = $2, email = $3, updated_at = now()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(auth.user_id)
    .bind(&username)
    .bind(&email)
    .fetch_one(pool)
    .await?;

    Ok(ApiResponse::success("Profile updated successfully", user, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_bounds_and_charset() {
        assert!(validate_username("eco1").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"a".repeat(31)).is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("dash-ed").is_err());
    }

    #[test]
    fn email_shape() {
        assert!(validate_email("buyer@example.com").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@nodot").is_err());
    }
}
