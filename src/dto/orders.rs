use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Order, PublicUser};

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
}

/// Display data for a purchased product. Always present: order items hold a
/// restrict-on-delete reference, so the product row cannot disappear.
#[derive(Debug, Serialize, ToSchema)]
pub struct OrderedProduct {
    pub id: Uuid,
    pub title: String,
    pub category: String,
    pub image_url: Option<String>,
    pub owner: PublicUser,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemDto {
    pub id: Uuid,
    pub product_id: Uuid,
    pub price_at_purchase: Decimal,
    pub quantity: i32,
    pub product: OrderedProduct,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderItemDto>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<OrderWithItems>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
    pub total_amount: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderStatsSummary {
    pub total_orders: i64,
    pub total_spent: Decimal,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderStats {
    pub stats: Vec<StatusCount>,
    pub summary: OrderStatsSummary,
}
