//! Analytics keyspace. `category` is always the resolved display name.

pub const TOTAL_SALES: &str = "total_ventas";
pub const MAX_PRICE_GLOBAL: &str = "precio_max_global";
pub const MIN_PRICE_GLOBAL: &str = "precio_min_global";
pub const RANKING_GLOBAL: &str = "ranking_productos";

/// Fields of one price history entry
pub const HISTORY_FIELD_PRICE: &str = "precio";
pub const HISTORY_FIELD_PRODUCT: &str = "producto";
pub const HISTORY_FIELD_TIMESTAMP: &str = "timestamp";

pub fn counter(category: &str) -> String {
    format!("counter:{}", category)
}

pub fn sum_price(category: &str) -> String {
    format!("suma_precio:{}", category)
}

pub fn sum_quantity(category: &str) -> String {
    format!("suma_cantidad:{}", category)
}

pub fn avg_price(category: &str) -> String {
    format!("promedio_precio:{}", category)
}

pub fn avg_quantity(category: &str) -> String {
    format!("promedio_productos:{}", category)
}

pub fn ranking(category: &str) -> String {
    format!("ranking_productos_cat:{}", category)
}

pub fn monitored_product(category: &str) -> String {
    format!("producto_monitoreado_nombre:{}", category)
}

pub fn price_history(category: &str) -> String {
    format!("stream_precio_producto_unico:{}", category)
}
