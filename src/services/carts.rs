use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        cart::{self, Entity as CartEntity},
        cart_item::{self, Entity as CartItemEntity},
        product::{self, Entity as ProductEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Input for adding a product line to a cart.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddItemInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    pub selected_size: Option<String>,
    pub selected_color: Option<String>,
}

/// Cart store: one cart per user, mutable line items.
///
/// Checkout consumes the cart but does not own it; the only cross-actor
/// mutation is the orchestrator clearing purchased lines inside the checkout
/// transaction. Stock is not checked here — it can change between add and
/// checkout, so the commit is the enforcement point.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Returns the user's cart, creating it on first use.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_or_create_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = CartEntity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        };
        match cart.insert(&*self.db).await {
            Ok(cart) => {
                info!(cart_id = %cart.id, "Created cart");
                Ok(cart)
            }
            Err(e) => {
                // A concurrent first add may have won the unique user_id
                // race; return the winner's cart.
                if let Some(existing) = CartEntity::find()
                    .filter(cart::Column::UserId.eq(user_id))
                    .one(&*self.db)
                    .await?
                {
                    return Ok(existing);
                }
                Err(ServiceError::DatabaseError(e))
            }
        }
    }

    /// Adds a product line, merging with an existing line that has the same
    /// product and selected options.
    #[instrument(skip(self, input), fields(user_id = %user_id, product_id = %input.product_id))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        input: AddItemInput,
    ) -> Result<cart_item::Model, ServiceError> {
        input.validate()?;

        let product = ProductEntity::find_by_id(input.product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;
        if !product.is_active {
            return Err(ServiceError::InvalidInput(format!(
                "Product {} is not available",
                product.id
            )));
        }

        let cart = self.get_or_create_cart(user_id).await?;
        let now = Utc::now();

        // NULL options only merge with NULL options.
        let mut query = CartItemEntity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::ProductId.eq(input.product_id));
        query = match &input.selected_size {
            Some(size) => query.filter(cart_item::Column::SelectedSize.eq(size.clone())),
            None => query.filter(cart_item::Column::SelectedSize.is_null()),
        };
        query = match &input.selected_color {
            Some(color) => query.filter(cart_item::Column::SelectedColor.eq(color.clone())),
            None => query.filter(cart_item::Column::SelectedColor.is_null()),
        };
        let existing = query.one(&*self.db).await?;

        let item = match existing {
            Some(line) => {
                let quantity = line.quantity + input.quantity;
                let mut active: cart_item::ActiveModel = line.into();
                active.quantity = Set(quantity);
                active.updated_at = Set(now);
                active.update(&*self.db).await?
            }
            None => {
                let item = cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(input.product_id),
                    quantity: Set(input.quantity),
                    selected_size: Set(input.selected_size),
                    selected_color: Set(input.selected_color),
                    added_at: Set(now),
                    updated_at: Set(now),
                };
                item.insert(&*self.db).await?
            }
        };

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                product_id: input.product_id,
                quantity: input.quantity,
            })
            .await;

        Ok(item)
    }

    /// Replaces a line's quantity.
    #[instrument(skip(self), fields(user_id = %user_id, item_id = %item_id))]
    pub async fn update_item_quantity(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> Result<cart_item::Model, ServiceError> {
        if quantity < 1 {
            return Err(ServiceError::InvalidInput(
                "Quantity must be at least 1".to_string(),
            ));
        }

        let item = self.find_owned_item(user_id, item_id).await?;
        let mut active: cart_item::ActiveModel = item.into();
        active.quantity = Set(quantity);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }

    /// Removes a line from the user's cart.
    #[instrument(skip(self), fields(user_id = %user_id, item_id = %item_id))]
    pub async fn remove_item(&self, user_id: Uuid, item_id: Uuid) -> Result<(), ServiceError> {
        let item = self.find_owned_item(user_id, item_id).await?;
        let cart_id = item.cart_id;
        item.delete(&*self.db).await?;

        self.event_sender
            .send_or_log(Event::CartItemRemoved { cart_id, item_id })
            .await;
        Ok(())
    }

    /// Returns the cart and its lines, oldest line first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_cart(
        &self,
        user_id: Uuid,
    ) -> Result<(cart::Model, Vec<cart_item::Model>), ServiceError> {
        let cart = self.get_or_create_cart(user_id).await?;
        let items = CartItemEntity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::AddedAt)
            .all(&*self.db)
            .await?;
        Ok((cart, items))
    }

    /// Fetches an item and verifies it lives in the caller's cart.
    /// Ownership mismatch is `Forbidden`, distinct from `NotFound`.
    async fn find_owned_item(
        &self,
        user_id: Uuid,
        item_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        let item = CartItemEntity::find_by_id(item_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;

        let cart = CartEntity::find_by_id(item.cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", item.cart_id)))?;

        if cart.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Cart item belongs to another user".to_string(),
            ));
        }
        Ok(item)
    }
}
