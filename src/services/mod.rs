pub mod cancellations;
pub mod carts;
pub mod inventory;
pub mod invoicing;
pub mod order_numbers;
pub mod orders;
pub mod payments;
