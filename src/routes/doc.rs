use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{AuthResponse, LoginRequest, RegisterRequest, UpdateProfileRequest},
        cart::{
            AddToCartRequest, CartCount, CartLineDto, CartProduct, CartSummary, CartView,
            ClearCartResponse, UpdateCartItemRequest,
        },
        orders::{
            OrderItemDto, OrderList, OrderStats, OrderStatsSummary, OrderWithItems,
            OrderedProduct, StatusCount, UpdateOrderStatusRequest,
        },
        products::{CreateProductRequest, ProductDto, ProductList, UpdateProductRequest},
    },
    models::{Order, Product, PublicUser, User},
    response::{ApiResponse, Meta},
    routes::{auth, cart, health, orders, params, products},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::register,
        auth::login,
        auth::me,
        auth::update_me,
        products::list_products,
        products::my_products,
        products::get_product,
        products::create_product,
        products::update_product,
        products::delete_product,
        cart::get_cart,
        cart::cart_count,
        cart::add_to_cart,
        cart::update_cart_item,
        cart::remove_from_cart,
        cart::clear_cart,
        orders::list_orders,
        orders::checkout,
        orders::order_stats,
        orders::get_order,
        orders::update_order_status,
    ),
    components(
        schemas(
            User,
            PublicUser,
            Product,
            Order,
            RegisterRequest,
            LoginRequest,
            UpdateProfileRequest,
            AuthResponse,
            CreateProductRequest,
            UpdateProductRequest,
            ProductDto,
            ProductList,
            AddToCartRequest,
            UpdateCartItemRequest,
            CartProduct,
            CartLineDto,
            CartSummary,
            CartView,
            CartCount,
            ClearCartResponse,
            UpdateOrderStatusRequest,
            OrderedProduct,
            OrderItemDto,
            OrderWithItems,
            OrderList,
            StatusCount,
            OrderStatsSummary,
            OrderStats,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            Meta,
            ApiResponse<ProductDto>,
            ApiResponse<ProductList>,
            ApiResponse<CartView>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<OrderStats>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Registration, login, and profile"),
        (name = "Products", description = "Second-hand product catalog"),
        (name = "Cart", description = "Per-user cart lines"),
        (name = "Orders", description = "Checkout and order history"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
