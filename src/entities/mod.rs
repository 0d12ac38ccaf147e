//! Database entities (sea-orm models).

pub mod address;
pub mod cart;
pub mod cart_item;
pub mod discount;
pub mod order;
pub mod order_item;
pub mod product;

// Re-export entities
pub use address::{Entity as Address, Model as AddressModel};
pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use discount::{DiscountType, Entity as Discount, Model as DiscountModel};
pub use order::{Entity as Order, Model as OrderModel, OrderStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use product::{Entity as Product, Model as ProductModel};
