//! Sale event schema shared by the ingestion bridge and the aggregator
//!
//! One `SaleEvent` is produced per transaction and carried on the `sales` topic as JSON.
//! Field names on the wire follow the producers (`categoria`, `producto_id`, `precio`,
//! `cantidad_vendida`); English aliases are accepted when decoding.

use serde::Serialize;
use serde_json::{Map, Value};

pub mod category;
pub mod error;

pub use category::{category_name, CategoryTable, CATEGORY_TABLE, FALLBACK_CATEGORY};
pub use error::DecodeError;

/// Topic name used when nothing else is configured
pub const DEFAULT_TOPIC: &str = "sales";

const CATEGORY_FIELD: &[&str] = &["categoria", "category"];
const PRODUCT_FIELD: &[&str] = &["producto_id", "product_id"];
const PRICE_FIELD: &[&str] = &["precio", "price"];
const QUANTITY_FIELD: &[&str] = &["cantidad_vendida", "quantity"];

/// A single sale, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleEvent {
    #[serde(rename = "categoria")]
    category: i32,
    #[serde(rename = "producto_id")]
    product_id: String,
    #[serde(rename = "precio")]
    price: f64,
    #[serde(rename = "cantidad_vendida")]
    quantity: u32,
}

impl SaleEvent {
    /// Build a validated event.
    pub fn new(
        category: i32,
        product_id: impl Into<String>,
        price: f64,
        quantity: u32,
    ) -> Result<Self, DecodeError> {
        let product_id = product_id.into();

        if product_id.trim().is_empty() {
            return Err(DecodeError::InvalidValue {
                field: PRODUCT_FIELD[0],
                reason: "must not be empty".to_string(),
            });
        }

        if !price.is_finite() || price < 0.0 {
            return Err(DecodeError::InvalidValue {
                field: PRICE_FIELD[0],
                reason: format!("must be a non-negative number, got {}", price),
            });
        }

        if quantity == 0 {
            return Err(DecodeError::InvalidValue {
                field: QUANTITY_FIELD[0],
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            category,
            product_id,
            price,
            quantity,
        })
    }

    /// Decode a wire payload.
    ///
    /// Distinguishes a payload that is not JSON at all from a missing field, a field of
    /// the wrong type, and a field whose value is out of range. An unknown category code
    /// is accepted and later resolves to [`FALLBACK_CATEGORY`].
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let category = lookup(obj, CATEGORY_FIELD)?
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or(DecodeError::WrongType {
                field: CATEGORY_FIELD[0],
                expected: "integer",
            })?;

        let product_id = lookup(obj, PRODUCT_FIELD)?
            .as_str()
            .ok_or(DecodeError::WrongType {
                field: PRODUCT_FIELD[0],
                expected: "string",
            })?;

        let price = lookup(obj, PRICE_FIELD)?
            .as_f64()
            .ok_or(DecodeError::WrongType {
                field: PRICE_FIELD[0],
                expected: "number",
            })?;

        let quantity = lookup(obj, QUANTITY_FIELD)?;
        let quantity = match quantity.as_i64() {
            Some(q) if q <= 0 => {
                return Err(DecodeError::InvalidValue {
                    field: QUANTITY_FIELD[0],
                    reason: format!("must be positive, got {}", q),
                })
            }
            Some(q) => u32::try_from(q).map_err(|_| DecodeError::InvalidValue {
                field: QUANTITY_FIELD[0],
                reason: format!("{} is out of range", q),
            })?,
            None => {
                return Err(DecodeError::WrongType {
                    field: QUANTITY_FIELD[0],
                    expected: "integer",
                })
            }
        };

        Self::new(category, product_id, price, quantity)
    }

    /// Canonical JSON encoding, as appended to the log.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn category(&self) -> i32 {
        self.category
    }

    /// Display name of the category, `"Other"` for unknown codes.
    pub fn category_name(&self) -> &'static str {
        category_name(self.category)
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }
}

/// First present, non-null field among `names` (canonical name first).
fn lookup<'a>(obj: &'a Map<String, Value>, names: &[&'static str]) -> Result<&'a Value, DecodeError> {
    names
        .iter()
        .find_map(|name| obj.get(*name).filter(|v| !v.is_null()))
        .ok_or(DecodeError::MissingField { field: names[0] })
}
