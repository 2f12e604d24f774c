use serde::{Deserialize, Serialize};

use crate::config::UpdateMode;
use crate::feed::Offer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    NotAvailable,
}

impl From<bool> for Presence {
    fn from(available: bool) -> Self {
        if available {
            Presence::Available
        } else {
            Presence::NotAvailable
        }
    }
}

/// One element of the `edit_by_external_id` request array.
///
/// `id` is the external code derived from the feed. Absent fields are left
/// out of the JSON so Prom keeps its current value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_in_stock: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

impl ProductUpdate {
    /// Builds the update for an offer, restricted to the fields `mode` allows.
    ///
    /// Returns `None` when the offer has nothing to send in that mode.
    pub fn from_offer(offer: &Offer, mode: UpdateMode) -> Option<Self> {
        let mut update = ProductUpdate {
            id: offer.code.clone(),
            price: None,
            quantity_in_stock: None,
            presence: None,
        };

        if mode.includes_price() {
            update.price = offer.price;
        }
        if mode.includes_stock() {
            update.quantity_in_stock = offer.quantity;
            update.presence = offer.available.map(Presence::from);
        }

        (!update.is_empty()).then_some(update)
    }

    /// True when no field besides `id` is set.
    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.quantity_in_stock.is_none() && self.presence.is_none()
    }
}

/// Body of a successful edit response.
///
/// Prom answers `{"processed_ids": [...], "errors": {"<id>": "<reason>"}}`.
/// Both keys are optional here, and `errors` is also accepted as a list.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EditResponse {
    pub processed_ids: Vec<serde_json::Value>,
    pub errors: serde_json::Value,
}

impl EditResponse {
    /// `(id, reason)` pairs for items Prom refused.
    pub fn rejections(&self) -> Vec<(String, String)> {
        match &self.errors {
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(id, reason)| (id.clone(), value_text(reason)))
                .collect(),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    let id = item.get("id").map(value_text).unwrap_or_default();
                    (id, value_text(item))
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
