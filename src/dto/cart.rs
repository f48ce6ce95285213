use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::PublicUser;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddToCartRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

/// Live product snapshot shown for a cart line.
#[derive(Debug, Serialize, ToSchema)]
pub struct CartProduct {
    pub id: Uuid,
    pub title: String,
    pub category: String,
    pub price: Decimal,
    pub image_url: Option<String>,
    pub owner: PublicUser,
}

/// A cart line; `product` is absent when the listing has since been deleted.
#[derive(Debug, Serialize, ToSchema)]
pub struct CartLineDto {
    pub id: Uuid,
    pub quantity: i32,
    pub product: Option<CartProduct>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartSummary {
    pub item_count: i64,
    pub total: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartView {
    pub items: Vec<CartLineDto>,
    pub summary: CartSummary,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartCount {
    pub item_count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClearCartResponse {
    pub deleted_items: u64,
}
