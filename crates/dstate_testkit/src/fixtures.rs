//! Test fixtures and store helpers.
//!
//! Provides a small catalog schema and a store seeded with a handful of
//! suppliers, products, and orders.

use dstate_core::{
    Config, DisconnectedState, MemorySession, MemoryStore, Query, RemovalPolicy, Schema, TypeDef,
};
use dstate_protocol::{FieldValue, Key, TypeTag};
use std::sync::Arc;

/// Supplier type.
pub const SUPPLIER: TypeTag = TypeTag::new(1);
/// Product type.
pub const PRODUCT: TypeTag = TypeTag::new(2);
/// Order type.
pub const ORDER: TypeTag = TypeTag::new(3);
/// Order line type; its order is a version root.
pub const ORDER_LINE: TypeTag = TypeTag::new(4);
/// Unversioned note type.
pub const NOTE: TypeTag = TypeTag::new(5);

/// Every catalog type, in dependency order.
pub const ALL_TYPES: [TypeTag; 5] = [SUPPLIER, PRODUCT, ORDER, ORDER_LINE, NOTE];

/// Supplier field ids.
pub mod supplier {
    use dstate_protocol::FieldId;

    /// Name.
    pub const NAME: FieldId = FieldId::new(0);
    /// Version counter.
    pub const VERSION: FieldId = FieldId::new(1);
    /// Featured products, cleared when a product is removed.
    pub const FEATURED: FieldId = FieldId::new(2);
}

/// Product field ids.
pub mod product {
    use dstate_protocol::FieldId;

    /// Name.
    pub const NAME: FieldId = FieldId::new(0);
    /// Price in cents.
    pub const PRICE: FieldId = FieldId::new(1);
    /// Supplier, cleared when the supplier is removed.
    pub const SUPPLIER: FieldId = FieldId::new(2);
    /// Lazy description.
    pub const DESCRIPTION: FieldId = FieldId::new(3);
    /// Version counter.
    pub const VERSION: FieldId = FieldId::new(4);
}

/// Order field ids.
pub mod order {
    use dstate_protocol::FieldId;

    /// Order number.
    pub const NUMBER: FieldId = FieldId::new(0);
    /// Version counter.
    pub const VERSION: FieldId = FieldId::new(1);
}

/// Order line field ids.
pub mod order_line {
    use dstate_protocol::FieldId;

    /// Owning order; removing the order cascades.
    pub const ORDER: FieldId = FieldId::new(0);
    /// Ordered product; removing the product is denied.
    pub const PRODUCT: FieldId = FieldId::new(1);
    /// Quantity.
    pub const QUANTITY: FieldId = FieldId::new(2);
    /// Version counter.
    pub const VERSION: FieldId = FieldId::new(3);
}

/// Note field ids.
pub mod note {
    use dstate_protocol::FieldId;

    /// Text.
    pub const TEXT: FieldId = FieldId::new(0);
    /// Annotated product, cleared when the product is removed.
    pub const PRODUCT: FieldId = FieldId::new(1);
}

/// Builds the catalog schema.
pub fn catalog_schema() -> Arc<Schema> {
    let types = [
        TypeDef::builder(SUPPLIER, "Supplier")
            .scalar("Name")
            .version_field("Version")
            .collection("Featured", PRODUCT, RemovalPolicy::Clear)
            .build(),
        TypeDef::builder(PRODUCT, "Product")
            .scalar("Name")
            .scalar("Price")
            .reference("Supplier", SUPPLIER, RemovalPolicy::Clear)
            .lazy_scalar("Description")
            .version_field("Version")
            .build(),
        TypeDef::builder(ORDER, "Order")
            .scalar("Number")
            .version_field("Version")
            .build(),
        TypeDef::builder(ORDER_LINE, "OrderLine")
            .reference("Order", ORDER, RemovalPolicy::Cascade)
            .reference("Product", PRODUCT, RemovalPolicy::Deny)
            .scalar("Quantity")
            .version_field("Version")
            .version_root("Order")
            .build(),
        TypeDef::builder(NOTE, "Note")
            .scalar("Text")
            .reference("Product", PRODUCT, RemovalPolicy::Clear)
            .build(),
    ];
    let types: Vec<TypeDef> = types
        .into_iter()
        .map(|t| t.expect("catalog type definition is valid"))
        .collect();
    Arc::new(Schema::new(types).expect("catalog schema is valid"))
}

/// Keys of the seeded catalog entities.
#[derive(Debug, Clone, Default)]
pub struct CatalogKeys {
    /// "Acme", "Globex".
    pub suppliers: Vec<Key>,
    /// "Widget" and "Gadget" from Acme, "Gizmo" from Globex.
    pub products: Vec<Key>,
    /// Orders 1001 and 1002.
    pub orders: Vec<Key>,
    /// One line per order: 2 Widgets on 1001, 5 Gizmos on 1002.
    pub lines: Vec<Key>,
}

/// A store over the catalog schema.
pub struct Catalog {
    /// The backing store.
    pub store: MemoryStore,
    /// Keys of the seeded entities.
    pub keys: CatalogKeys,
}

impl Catalog {
    /// Creates an empty catalog store.
    pub fn empty() -> Self {
        Self {
            store: MemoryStore::new(catalog_schema()),
            keys: CatalogKeys::default(),
        }
    }

    /// Creates a catalog store with deterministic seed data.
    ///
    /// Two seeded catalogs hold identical rows under identical keys.
    pub fn seeded() -> Self {
        let store = MemoryStore::new(catalog_schema());
        let seed = |tag, values| store.seed(tag, values).expect("seed data is valid");

        let acme = seed(SUPPLIER, vec![(supplier::NAME, "Acme".into())]);
        let globex = seed(SUPPLIER, vec![(supplier::NAME, "Globex".into())]);
        let add_product = |name: &str, price: i64, by: &Key| {
            seed(
                PRODUCT,
                vec![
                    (product::NAME, name.into()),
                    (product::PRICE, price.into()),
                    (product::SUPPLIER, by.clone().into()),
                    (product::DESCRIPTION, format!("The {name}").into()),
                ],
            )
        };
        let widget = add_product("Widget", 250, &acme);
        let gadget = add_product("Gadget", 1200, &acme);
        let gizmo = add_product("Gizmo", 75, &globex);

        let first = seed(ORDER, vec![(order::NUMBER, 1001.into())]);
        let second = seed(ORDER, vec![(order::NUMBER, 1002.into())]);
        let add_line = |order: &Key, product: &Key, quantity: i64| {
            seed(
                ORDER_LINE,
                vec![
                    (order_line::ORDER, order.clone().into()),
                    (order_line::PRODUCT, product.clone().into()),
                    (order_line::QUANTITY, quantity.into()),
                ],
            )
        };
        let first_line = add_line(&first, &widget, 2);
        let second_line = add_line(&second, &gizmo, 5);

        Self {
            keys: CatalogKeys {
                suppliers: vec![acme, globex],
                products: vec![widget, gadget, gizmo],
                orders: vec![first, second],
                lines: vec![first_line, second_line],
            },
            store,
        }
    }

    /// Creates a disconnected state over the catalog schema.
    pub fn state(&self) -> DisconnectedState {
        self.state_with(Config::default())
    }

    /// Creates a disconnected state with a custom configuration.
    pub fn state_with(&self, config: Config) -> DisconnectedState {
        DisconnectedState::new(Arc::clone(self.store.schema()), config)
    }

    /// Attaches, connects, and prefetches every entity of every type.
    pub fn prefetch_all(&self, state: &mut DisconnectedState, session: &mut MemorySession) -> Vec<Key> {
        let mut attached = state.attach(session).expect("state is detached");
        let mut connected = attached.connect();
        let mut keys = Vec::new();
        for tag in ALL_TYPES {
            keys.extend(connected.prefetch(&Query::All(tag)).expect("prefetch succeeds"));
        }
        keys
    }

    /// Returns the text stored in `field` of `key`.
    pub fn text(&self, key: &Key, field: dstate_protocol::FieldId) -> Option<String> {
        match self.store.field(key, field)? {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Follows a reference field in the store.
    pub fn follow(&self, key: &Key, field: dstate_protocol::FieldId) -> Option<Key> {
        match self.store.field(key, field)? {
            FieldValue::Ref(target) => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_catalogs_are_identical() {
        let a = Catalog::seeded();
        let b = Catalog::seeded();
        assert_eq!(a.keys.products, b.keys.products);
        for key in &a.keys.products {
            assert_eq!(a.store.row(key), b.store.row(key));
        }
    }

    #[test]
    fn follow_and_text() {
        let catalog = Catalog::seeded();
        let widget = &catalog.keys.products[0];
        let acme = catalog.follow(widget, product::SUPPLIER).unwrap();
        assert_eq!(catalog.text(&acme, supplier::NAME).as_deref(), Some("Acme"));
    }
}
