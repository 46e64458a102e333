//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random keys, values, mappings, and
//! edit scripts over the catalog fixture.

use crate::fixtures::{order_line, product, CatalogKeys, ORDER_LINE, PRODUCT};
use dstate_core::{CoreResult, DisconnectedState};
use dstate_protocol::{FieldValue, Key, KeyMapping, TypeTag};
use proptest::prelude::*;

/// Strategy for scalar field values.
pub fn scalar_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Integer),
        "[a-zA-Z0-9 ]{0,16}".prop_map(FieldValue::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(FieldValue::Bytes),
    ]
}

/// Strategy for keys over a few types, temporary or permanent.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    (1u32..4, 1i64..64, any::<bool>()).prop_map(|(tag, id, temporary)| {
        let values = vec![FieldValue::Integer(id)];
        if temporary {
            Key::temporary(TypeTag::new(tag), values)
        } else {
            Key::permanent(TypeTag::new(tag), values)
        }
    })
}

/// Strategy for valid key mappings: distinct temporary keys mapped to
/// distinct permanent keys of the same type.
pub fn key_mapping_strategy() -> impl Strategy<Value = KeyMapping> {
    prop::collection::btree_set((1u32..4, 1i64..64), 0..16).prop_map(|ids| {
        let mut mapping = KeyMapping::new();
        for (tag, id) in ids {
            let tag = TypeTag::new(tag);
            let temporary = Key::temporary(tag, vec![FieldValue::Integer(id)]);
            let permanent = Key::from_id(tag, id + 1000);
            mapping
                .insert(temporary, permanent)
                .expect("generated pairs are distinct");
        }
        mapping
    })
}

/// One offline edit against the catalog.
///
/// Indices are taken modulo the number of live entities of that kind.
#[derive(Debug, Clone)]
pub enum CatalogEdit {
    /// Creates a product supplied by a supplier.
    CreateProduct {
        /// Product name.
        name: String,
        /// Price.
        price: i64,
        /// Supplier index.
        supplier: usize,
    },
    /// Renames a product.
    Rename {
        /// Product index.
        product: usize,
        /// New name.
        name: String,
    },
    /// Changes a product's price.
    Reprice {
        /// Product index.
        product: usize,
        /// New price.
        price: i64,
    },
    /// Moves a product to another supplier.
    MoveProduct {
        /// Product index.
        product: usize,
        /// Supplier index.
        supplier: usize,
    },
    /// Adds a line to an order.
    AddLine {
        /// Order index.
        order: usize,
        /// Product index.
        product: usize,
        /// Quantity.
        quantity: i64,
    },
    /// Changes a line's quantity.
    SetQuantity {
        /// Line index.
        line: usize,
        /// Quantity.
        quantity: i64,
    },
    /// Moves a line to another order.
    MoveLine {
        /// Line index.
        line: usize,
        /// Order index.
        order: usize,
    },
    /// Removes a line.
    RemoveLine {
        /// Line index.
        line: usize,
    },
}

impl CatalogEdit {
    /// Applies the edit and returns the keys whose version must change.
    ///
    /// `keys` tracks the live catalog entities and is updated for creates
    /// and removals. Edits whose target list is empty do nothing.
    ///
    /// # Errors
    ///
    /// Propagates errors from the disconnected state.
    pub fn apply(&self, state: &mut DisconnectedState, keys: &mut CatalogKeys) -> CoreResult<Vec<Key>> {
        let pick = |list: &[Key], index: usize| -> Option<Key> {
            (!list.is_empty()).then(|| list[index % list.len()].clone())
        };
        match self {
            Self::CreateProduct {
                name,
                price,
                supplier,
            } => {
                let Some(supplier) = pick(&keys.suppliers, *supplier) else {
                    return Ok(Vec::new());
                };
                let key = state.create_with(
                    PRODUCT,
                    vec![
                        (product::NAME, name.as_str().into()),
                        (product::PRICE, (*price).into()),
                        (product::SUPPLIER, supplier.into()),
                    ],
                )?;
                keys.products.push(key.clone());
                Ok(vec![key])
            }
            Self::Rename { product, name } => {
                let Some(key) = pick(&keys.products, *product) else {
                    return Ok(Vec::new());
                };
                state.set_field(&key, product::NAME, name.as_str())?;
                Ok(vec![key])
            }
            Self::Reprice { product, price } => {
                let Some(key) = pick(&keys.products, *product) else {
                    return Ok(Vec::new());
                };
                state.set_field(&key, product::PRICE, *price)?;
                Ok(vec![key])
            }
            Self::MoveProduct { product, supplier } => {
                let (Some(key), Some(supplier)) =
                    (pick(&keys.products, *product), pick(&keys.suppliers, *supplier))
                else {
                    return Ok(Vec::new());
                };
                state.set_field(&key, product::SUPPLIER, supplier)?;
                Ok(vec![key])
            }
            Self::AddLine {
                order,
                product,
                quantity,
            } => {
                let (Some(order), Some(product)) =
                    (pick(&keys.orders, *order), pick(&keys.products, *product))
                else {
                    return Ok(Vec::new());
                };
                let key = state.create_with(
                    ORDER_LINE,
                    vec![
                        (order_line::ORDER, order.clone().into()),
                        (order_line::PRODUCT, product.into()),
                        (order_line::QUANTITY, (*quantity).into()),
                    ],
                )?;
                keys.lines.push(key.clone());
                Ok(vec![key, order])
            }
            Self::SetQuantity { line, quantity } => {
                let Some(line) = pick(&keys.lines, *line) else {
                    return Ok(Vec::new());
                };
                let order = line_order(state, &line)?;
                state.set_field(&line, order_line::QUANTITY, *quantity)?;
                Ok(vec![line, order])
            }
            Self::MoveLine { line, order } => {
                let (Some(line), Some(order)) =
                    (pick(&keys.lines, *line), pick(&keys.orders, *order))
                else {
                    return Ok(Vec::new());
                };
                let previous = line_order(state, &line)?;
                state.set_field(&line, order_line::ORDER, order.clone())?;
                Ok(vec![line, previous, order])
            }
            Self::RemoveLine { line } => {
                let Some(line) = pick(&keys.lines, *line) else {
                    return Ok(Vec::new());
                };
                let order = line_order(state, &line)?;
                state.remove(&line)?;
                keys.lines.retain(|k| *k != line);
                Ok(vec![order])
            }
        }
    }
}

fn line_order(state: &DisconnectedState, line: &Key) -> CoreResult<Key> {
    let order = state.field(line, order_line::ORDER)?;
    Ok(order.as_key().cloned().unwrap_or_else(|| line.clone()))
}

/// Strategy for a single catalog edit.
pub fn catalog_edit_strategy() -> impl Strategy<Value = CatalogEdit> {
    let index = 0usize..8;
    prop_oneof![
        ("[A-Z][a-z]{2,8}", 1i64..10_000, index.clone()).prop_map(|(name, price, supplier)| {
            CatalogEdit::CreateProduct {
                name,
                price,
                supplier,
            }
        }),
        (index.clone(), "[A-Z][a-z]{2,8}")
            .prop_map(|(product, name)| CatalogEdit::Rename { product, name }),
        (index.clone(), 1i64..10_000)
            .prop_map(|(product, price)| CatalogEdit::Reprice { product, price }),
        (index.clone(), index.clone())
            .prop_map(|(product, supplier)| CatalogEdit::MoveProduct { product, supplier }),
        (index.clone(), index.clone(), 1i64..100).prop_map(|(order, product, quantity)| {
            CatalogEdit::AddLine {
                order,
                product,
                quantity,
            }
        }),
        (index.clone(), 1i64..100)
            .prop_map(|(line, quantity)| CatalogEdit::SetQuantity { line, quantity }),
        (index.clone(), index.clone()).prop_map(|(line, order)| CatalogEdit::MoveLine { line, order }),
        index.prop_map(|line| CatalogEdit::RemoveLine { line }),
    ]
}

/// Strategy for a script of catalog edits.
pub fn catalog_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<CatalogEdit>> {
    prop::collection::vec(catalog_edit_strategy(), 1..max_len.max(2))
}
