//! Sales aggregation over completed orders.
//!
//! Daily buckets use the UTC calendar date of `created_at`. Top products are
//! ranked by quantity sold, then revenue, then product id, so equal rows
//! always come out in the same order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::CompletedOrder;

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The last `days` days ending at `now`.
    pub fn last_days(days: i64, now: DateTime<Utc>) -> Self {
        Self {
            start: now - Duration::days(days),
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopProduct {
    pub product_id: String,
    pub product_name: String,
    pub quantity: i64,
    pub revenue: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySales {
    pub date: NaiveDate,
    pub orders: usize,
    pub revenue: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SalesAnalytics {
    pub total_orders: usize,
    pub total_revenue: Decimal,
    pub total_commission: Decimal,
    pub products_sold: i64,
    pub top_products: Vec<TopProduct>,
    pub daily_sales: Vec<DailySales>,
}

/// Aggregate completed orders falling inside `range`.
pub fn aggregate(orders: &[CompletedOrder], range: &DateRange, top_limit: usize) -> SalesAnalytics {
    let mut summary = SalesAnalytics::default();
    let mut by_product: HashMap<&str, TopProduct> = HashMap::new();
    let mut by_day: BTreeMap<NaiveDate, DailySales> = BTreeMap::new();

    for order in orders.iter().filter(|o| range.contains(o.created_at)) {
        summary.total_orders += 1;
        summary.total_revenue += order.total_amount;
        summary.total_commission += order.total_commission;

        let date = order.created_at.date_naive();
        let day = by_day.entry(date).or_insert_with(|| DailySales {
            date,
            orders: 0,
            revenue: Decimal::ZERO,
            commission: Decimal::ZERO,
        });
        day.orders += 1;
        day.revenue += order.total_amount;
        day.commission += order.total_commission;

        for item in &order.items {
            summary.products_sold += item.quantity;
            let entry = by_product
                .entry(item.product_id.as_str())
                .or_insert_with(|| TopProduct {
                    product_id: item.product_id.clone(),
                    product_name: item.product_name.clone(),
                    quantity: 0,
                    revenue: Decimal::ZERO,
                });
            entry.quantity += item.quantity;
            entry.revenue += item.subtotal;
        }
    }

    let mut products: Vec<TopProduct> = by_product.into_values().collect();
    products.sort_by(rank_products);
    products.truncate(top_limit);

    summary.top_products = products;
    summary.daily_sales = by_day.into_values().collect();
    summary
}

fn rank_products(a: &TopProduct, b: &TopProduct) -> Ordering {
    b.quantity
        .cmp(&a.quantity)
        .then_with(|| b.revenue.cmp(&a.revenue))
        .then_with(|| a.product_id.cmp(&b.product_id))
}
