use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// Query parameters of the markets endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub vs_currency: String,
    pub order: String,
    pub per_page: u32,
    pub sparkline: bool,
}

impl SourceQuery {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            vs_currency: settings.currency_unit.clone(),
            order: settings.source_order.clone(),
            per_page: settings.page_size,
            sparkline: settings.sparkline,
        }
    }

    pub fn to_pairs(&self) -> [(&'static str, String); 4] {
        [
            ("vs_currency", self.vs_currency.clone()),
            ("order", self.order.clone()),
            ("per_page", self.per_page.to_string()),
            ("sparkline", self.sparkline.to_string()),
        ]
    }
}

impl Default for SourceQuery {
    fn default() -> Self {
        Self {
            vs_currency: "usd".to_string(),
            order: "market_cap_desc".to_string(),
            per_page: 10,
            sparkline: false,
        }
    }
}
