use serde::{Deserialize, Serialize};

use foldwise_core::{
    Aggregate, AggregateId, AggregatePayload, AggregateProjector, DomainError, DomainResult,
    ExpectedVersion, PartitionKeys,
};
use foldwise_events::{Command, DomainEvent};

/// Stream group every cart lives in.
pub const CART_GROUP: &str = "cart";

/// Partition keys of an existing cart.
pub fn cart_keys(cart_id: AggregateId, root_partition_key: &str) -> PartitionKeys {
    PartitionKeys::existing(CART_GROUP, cart_id).with_root_partition(root_partition_key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCart {
    pub owner: String,
    pub items: Vec<CartItem>,
}

impl ActiveCart {
    /// Sum of all lines, or `None` if it does not fit in an `i64`.
    pub fn total_cents(&self) -> Option<i64> {
        self.items.iter().try_fold(0i64, |total, item| {
            i64::from(item.quantity)
                .checked_mul(item.unit_price_cents)
                .and_then(|line| total.checked_add(line))
        })
    }

    /// The cart after adding a line. A known sku keeps its first unit price.
    /// `None` when the merged quantity or the cart total would overflow.
    pub fn with_item(&self, sku: &str, quantity: u32, unit_price_cents: i64) -> Option<ActiveCart> {
        let mut cart = self.clone();
        match cart.items.iter_mut().find(|i| i.sku == sku) {
            Some(item) => item.quantity = item.quantity.checked_add(quantity)?,
            None => cart.items.push(CartItem {
                sku: sku.to_string(),
                quantity,
                unit_price_cents,
            }),
        }
        cart.total_cents()?;
        Some(cart)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedOutCart {
    pub owner: String,
    pub items: Vec<CartItem>,
    pub total_cents: i64,
}

/// Cart lifecycle. Each state is its own variant so commands can match on
/// what the cart currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartPayload {
    Empty,
    Active(ActiveCart),
    CheckedOut(CheckedOutCart),
    Deleted { owner: String },
}

impl AggregatePayload for CartPayload {
    fn empty() -> Self {
        CartPayload::Empty
    }

    fn variant_name(&self) -> &'static str {
        match self {
            CartPayload::Empty => "Empty",
            CartPayload::Active(_) => "Active",
            CartPayload::CheckedOut(_) => "CheckedOut",
            CartPayload::Deleted { .. } => "Deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartEvent {
    CartCreated {
        owner: String,
    },
    ItemAdded {
        sku: String,
        quantity: u32,
        unit_price_cents: i64,
    },
    CartCheckedOut {
        total_cents: i64,
    },
    CartDeleted,
}

impl DomainEvent for CartEvent {
    const EVENT_TYPES: &'static [&'static str] =
        &["CartCreated", "ItemAdded", "CartCheckedOut", "CartDeleted"];

    fn event_type(&self) -> &'static str {
        match self {
            CartEvent::CartCreated { .. } => "CartCreated",
            CartEvent::ItemAdded { .. } => "ItemAdded",
            CartEvent::CartCheckedOut { .. } => "CartCheckedOut",
            CartEvent::CartDeleted => "CartDeleted",
        }
    }
}

pub struct CartProjector;

impl AggregateProjector for CartProjector {
    type Payload = CartPayload;
    type Event = CartEvent;
    const NAME: &'static str = "cart";

    fn project(payload: &CartPayload, event: &CartEvent) -> CartPayload {
        match (payload, event) {
            (CartPayload::Empty, CartEvent::CartCreated { owner }) => CartPayload::Active(ActiveCart {
                owner: owner.clone(),
                items: Vec::new(),
            }),
            (
                CartPayload::Active(cart),
                CartEvent::ItemAdded {
                    sku,
                    quantity,
                    unit_price_cents,
                },
            ) => match cart.with_item(sku, *quantity, *unit_price_cents) {
                Some(cart) => CartPayload::Active(cart),
                // AddItem rejects these; a hand-written stream may still hold one.
                None => payload.clone(),
            },
            (CartPayload::Active(cart), CartEvent::CartCheckedOut { total_cents }) => {
                CartPayload::CheckedOut(CheckedOutCart {
                    owner: cart.owner.clone(),
                    items: cart.items.clone(),
                    total_cents: *total_cents,
                })
            }
            (CartPayload::Active(ActiveCart { owner, .. }), CartEvent::CartDeleted)
            | (CartPayload::CheckedOut(CheckedOutCart { owner, .. }), CartEvent::CartDeleted) => {
                CartPayload::Deleted {
                    owner: owner.clone(),
                }
            }
            // Events that do not fit the current state leave it unchanged.
            (current, _) => current.clone(),
        }
    }
}

/// Command: CreateCart. Carries freshly generated keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCart {
    pub partition_keys: PartitionKeys,
    pub owner: String,
}

impl CreateCart {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            partition_keys: PartitionKeys::generate(CART_GROUP),
            owner: owner.into(),
        }
    }

    pub fn in_root_partition(mut self, root_partition_key: impl Into<String>) -> Self {
        self.partition_keys = self.partition_keys.with_root_partition(root_partition_key);
        self
    }
}

impl Command for CreateCart {
    type Projector = CartProjector;

    fn partition_keys(&self) -> PartitionKeys {
        self.partition_keys.clone()
    }

    fn handle(&self, aggregate: &Aggregate<CartPayload>) -> DomainResult<Vec<CartEvent>> {
        if !matches!(aggregate.payload(), CartPayload::Empty) {
            return Err(DomainError::validation("cart already exists"));
        }
        if self.owner.trim().is_empty() {
            return Err(DomainError::validation("owner cannot be empty"));
        }
        Ok(vec![CartEvent::CartCreated {
            owner: self.owner.clone(),
        }])
    }
}

/// Command: AddItem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddItem {
    pub cart_id: AggregateId,
    pub root_partition_key: String,
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub expected_version: ExpectedVersion,
}

impl AddItem {
    pub fn new(cart_id: AggregateId, sku: impl Into<String>, quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            cart_id,
            root_partition_key: foldwise_core::DEFAULT_ROOT_PARTITION_KEY.to_string(),
            sku: sku.into(),
            quantity,
            unit_price_cents,
            expected_version: ExpectedVersion::Any,
        }
    }

    pub fn in_root_partition(mut self, root_partition_key: impl Into<String>) -> Self {
        self.root_partition_key = root_partition_key.into();
        self
    }

    /// Only apply if the cart is still at `version`.
    pub fn expecting_version(mut self, version: u64) -> Self {
        self.expected_version = ExpectedVersion::Exact(version);
        self
    }
}

impl Command for AddItem {
    type Projector = CartProjector;

    fn partition_keys(&self) -> PartitionKeys {
        cart_keys(self.cart_id, &self.root_partition_key)
    }

    fn expected_version(&self) -> ExpectedVersion {
        self.expected_version
    }

    fn handle(&self, aggregate: &Aggregate<CartPayload>) -> DomainResult<Vec<CartEvent>> {
        let cart = match aggregate.payload() {
            CartPayload::Active(cart) => cart,
            CartPayload::CheckedOut(_) => {
                return Err(DomainError::validation("cart is already checked out"));
            }
            CartPayload::Empty | CartPayload::Deleted { .. } => return Err(DomainError::not_found()),
        };
        if self.sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if self.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if self.unit_price_cents < 0 {
            return Err(DomainError::validation("price cannot be negative"));
        }
        if cart
            .with_item(&self.sku, self.quantity, self.unit_price_cents)
            .is_none()
        {
            return Err(DomainError::validation("item quantity or cart total is too large"));
        }
        Ok(vec![CartEvent::ItemAdded {
            sku: self.sku.clone(),
            quantity: self.quantity,
            unit_price_cents: self.unit_price_cents,
        }])
    }
}

/// Command: CheckOutCart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutCart {
    pub cart_id: AggregateId,
    pub root_partition_key: String,
}

impl CheckOutCart {
    pub fn new(cart_id: AggregateId) -> Self {
        Self {
            cart_id,
            root_partition_key: foldwise_core::DEFAULT_ROOT_PARTITION_KEY.to_string(),
        }
    }
}

impl Command for CheckOutCart {
    type Projector = CartProjector;

    fn partition_keys(&self) -> PartitionKeys {
        cart_keys(self.cart_id, &self.root_partition_key)
    }

    fn handle(&self, aggregate: &Aggregate<CartPayload>) -> DomainResult<Vec<CartEvent>> {
        match aggregate.payload() {
            CartPayload::Active(cart) if cart.items.is_empty() => {
                Err(DomainError::validation("cannot check out an empty cart"))
            }
            CartPayload::Active(cart) => {
                let total_cents = cart
                    .total_cents()
                    .ok_or_else(|| DomainError::validation("cart total is too large"))?;
                Ok(vec![CartEvent::CartCheckedOut { total_cents }])
            }
            CartPayload::CheckedOut(_) => Err(DomainError::validation("cart is already checked out")),
            CartPayload::Empty | CartPayload::Deleted { .. } => Err(DomainError::not_found()),
        }
    }
}

/// Command: DeleteCart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCart {
    pub cart_id: AggregateId,
    pub root_partition_key: String,
}

impl DeleteCart {
    pub fn new(cart_id: AggregateId) -> Self {
        Self {
            cart_id,
            root_partition_key: foldwise_core::DEFAULT_ROOT_PARTITION_KEY.to_string(),
        }
    }
}

impl Command for DeleteCart {
    type Projector = CartProjector;

    fn partition_keys(&self) -> PartitionKeys {
        cart_keys(self.cart_id, &self.root_partition_key)
    }

    fn handle(&self, aggregate: &Aggregate<CartPayload>) -> DomainResult<Vec<CartEvent>> {
        match aggregate.payload() {
            CartPayload::Active(_) | CartPayload::CheckedOut(_) => Ok(vec![CartEvent::CartDeleted]),
            CartPayload::Empty | CartPayload::Deleted { .. } => Err(DomainError::not_found()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldwise_core::SortableIdGenerator;
    use proptest::prelude::*;

    fn fold(keys: &PartitionKeys, events: &[CartEvent]) -> Aggregate<CartPayload> {
        let ids = SortableIdGenerator::system();
        let mut aggregate = Aggregate::empty(keys.clone());
        for event in events {
            let version = aggregate.version() + 1;
            aggregate
                .apply::<CartProjector>(Some(event), version, &ids.next_id())
                .unwrap();
        }
        aggregate
    }

    fn created(owner: &str) -> CartEvent {
        CartEvent::CartCreated {
            owner: owner.to_string(),
        }
    }

    fn added(sku: &str, quantity: u32, price: i64) -> CartEvent {
        CartEvent::ItemAdded {
            sku: sku.to_string(),
            quantity,
            unit_price_cents: price,
        }
    }

    #[test]
    fn create_then_add_items_accumulates_quantities() {
        let create = CreateCart::new("alice");
        let keys = create.partition_keys();
        let events = create.handle(&Aggregate::empty(keys.clone())).unwrap();
        assert_eq!(events, vec![created("alice")]);

        let cart = fold(&keys, &[created("alice"), added("a", 1, 300), added("a", 2, 300)]);
        let CartPayload::Active(active) = cart.payload() else {
            panic!("expected active cart");
        };
        assert_eq!(active.items.len(), 1);
        assert_eq!(active.items[0].quantity, 3);
        assert_eq!(active.total_cents(), Some(900));
        assert_eq!(cart.version(), 3);
    }

    #[test]
    fn create_twice_is_rejected() {
        let create = CreateCart::new("alice");
        let cart = fold(&create.partition_keys(), &[created("alice")]);
        assert!(matches!(create.handle(&cart), Err(DomainError::Validation(_))));
    }

    #[test]
    fn add_item_to_missing_cart_is_not_found() {
        let add = AddItem::new(AggregateId::new(), "a", 1, 100);
        let empty = Aggregate::empty(add.partition_keys());
        assert_eq!(add.handle(&empty), Err(DomainError::NotFound));
    }

    #[test]
    fn add_item_validates_input() {
        let keys = PartitionKeys::generate(CART_GROUP);
        let cart = fold(&keys, &[created("alice")]);
        let id = keys.aggregate_id();

        assert!(AddItem::new(id, " ", 1, 100).handle(&cart).is_err());
        assert!(AddItem::new(id, "a", 0, 100).handle(&cart).is_err());
        assert!(AddItem::new(id, "a", 1, -5).handle(&cart).is_err());
        assert!(AddItem::new(id, "a", 1, 0).handle(&cart).is_ok());
    }

    #[test]
    fn add_item_rejects_quantities_that_would_overflow_the_line() {
        let keys = PartitionKeys::generate(CART_GROUP);
        let id = keys.aggregate_id();
        let cart = fold(&keys, &[created("dave"), added("a", u32::MAX, 1)]);

        assert!(matches!(
            AddItem::new(id, "a", 1, 1).handle(&cart),
            Err(DomainError::Validation(_))
        ));
        assert!(AddItem::new(id, "b", 1, 1).handle(&cart).is_ok());
    }

    #[test]
    fn add_item_rejects_prices_that_would_overflow_the_total() {
        let keys = PartitionKeys::generate(CART_GROUP);
        let id = keys.aggregate_id();
        let cart = fold(&keys, &[created("erin")]);

        assert!(AddItem::new(id, "a", 2, i64::MAX).handle(&cart).is_err());

        let cart = fold(&keys, &[created("erin"), added("a", 1, i64::MAX)]);
        assert!(AddItem::new(id, "b", 1, 1).handle(&cart).is_err());
        assert!(AddItem::new(id, "b", 1, 0).handle(&cart).is_ok());
    }

    #[test]
    fn overflowing_item_event_leaves_the_cart_unchanged() {
        let keys = PartitionKeys::generate(CART_GROUP);
        let before = fold(&keys, &[created("frank"), added("a", u32::MAX, 1)]);
        let after = fold(
            &keys,
            &[created("frank"), added("a", u32::MAX, 1), added("a", 1, 1)],
        );

        assert_eq!(after.payload(), before.payload());
        assert_eq!(after.version(), 3);

        let overpriced = fold(&keys, &[created("frank"), added("a", 3, i64::MAX / 2)]);
        assert!(matches!(overpriced.payload(), CartPayload::Active(c) if c.items.is_empty()));
    }

    #[test]
    fn checkout_requires_items_and_happens_once() {
        let keys = PartitionKeys::generate(CART_GROUP);
        let checkout = CheckOutCart::new(keys.aggregate_id());

        let empty_cart = fold(&keys, &[created("bob")]);
        assert!(checkout.handle(&empty_cart).is_err());

        let cart = fold(&keys, &[created("bob"), added("a", 2, 150)]);
        assert_eq!(
            checkout.handle(&cart).unwrap(),
            vec![CartEvent::CartCheckedOut { total_cents: 300 }]
        );

        let done = fold(
            &keys,
            &[created("bob"), added("a", 2, 150), CartEvent::CartCheckedOut { total_cents: 300 }],
        );
        assert!(matches!(done.payload(), CartPayload::CheckedOut(c) if c.total_cents == 300));
        assert!(checkout.handle(&done).is_err());
        assert!(AddItem::new(keys.aggregate_id(), "b", 1, 1).handle(&done).is_err());
    }

    #[test]
    fn deleted_cart_rejects_further_commands() {
        let keys = PartitionKeys::generate(CART_GROUP);
        let id = keys.aggregate_id();
        let cart = fold(&keys, &[created("carol"), CartEvent::CartDeleted]);

        assert_eq!(
            cart.payload(),
            &CartPayload::Deleted {
                owner: "carol".to_string()
            }
        );
        assert_eq!(DeleteCart::new(id).handle(&cart), Err(DomainError::NotFound));
        assert_eq!(
            AddItem::new(id, "a", 1, 1).handle(&cart),
            Err(DomainError::NotFound)
        );
    }

    #[test]
    fn commands_route_to_the_cart_stream() {
        let id = AggregateId::new();
        let keys = AddItem::new(id, "a", 1, 1).in_root_partition("tenant-1").partition_keys();
        assert_eq!(keys, cart_keys(id, "tenant-1"));
        assert_eq!(keys.group(), CART_GROUP);
        assert_eq!(CheckOutCart::new(id).partition_keys(), DeleteCart::new(id).partition_keys());
    }

    #[test]
    fn events_serialize_adjacently_tagged() {
        let json = serde_json::to_value(added("a", 1, 5)).unwrap();
        assert_eq!(json["type"], "ItemAdded");
        assert_eq!(json["data"]["sku"], "a");

        let deleted = serde_json::to_value(CartEvent::CartDeleted).unwrap();
        assert_eq!(deleted["type"], "CartDeleted");
        assert_eq!(
            serde_json::from_value::<CartEvent>(deleted).unwrap(),
            CartEvent::CartDeleted
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn total_matches_sum_of_added_lines(lines in prop::collection::vec((0u8..4, 1u32..10, 0i64..1_000), 0..20)) {
            let keys = PartitionKeys::generate(CART_GROUP);
            let mut events = vec![created("p")];
            events.extend(lines.iter().map(|(sku, q, p)| added(&format!("sku-{sku}"), *q, *p)));

            let cart = fold(&keys, &events);
            let CartPayload::Active(active) = cart.payload() else {
                panic!("expected active cart");
            };

            // Unit price is fixed by the first line for a sku.
            let mut expected = 0i64;
            let mut first_price = std::collections::HashMap::new();
            for (sku, q, p) in &lines {
                let price = *first_price.entry(*sku).or_insert(*p);
                expected += i64::from(*q) * price;
            }
            prop_assert_eq!(active.total_cents(), Some(expected));
            prop_assert_eq!(cart.version(), events.len() as u64);
        }
    }
}
