//! Shopping-cart sample domain (event-sourced).
//!
//! This crate contains business rules for carts, implemented purely as
//! deterministic domain logic (no IO, no storage). It exercises every
//! contract the engine offers: an aggregate with commands, a cross-stream
//! read model and list/scalar queries over it.

pub mod cart;
pub mod summary;

pub use cart::{
    ActiveCart, AddItem, CART_GROUP, CartEvent, CartItem, CartPayload, CartProjector, CheckOutCart,
    CheckedOutCart, CreateCart, DeleteCart, cart_keys,
};
pub use summary::{
    CartCountQuery, CartListQuery, CartStatus, CartSummaries, CartSummary, CartSummaryProjector,
};
