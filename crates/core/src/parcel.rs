use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{CoreError, FieldValue, TrackingCode};

/// A physical parcel. Everything except the tracking code is opaque to
/// the custody engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    pub tracking_code: TrackingCode,
    pub description: String,
    pub weight_grams: Option<u64>,
    pub order_ref: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, FieldValue>,
}

impl Parcel {
    pub fn new(tracking_code: TrackingCode, description: impl Into<String>) -> Self {
        Self {
            tracking_code,
            description: description.into(),
            weight_grams: None,
            order_ref: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, grams: u64) -> Self {
        self.weight_grams = Some(grams);
        self
    }

    pub fn with_order_ref(mut self, order_ref: impl Into<String>) -> Self {
        self.order_ref = Some(order_ref.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn attributes_to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(&self.attributes).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn attributes_from_msgpack(
        bytes: &[u8],
    ) -> Result<BTreeMap<String, FieldValue>, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Server-assigned custody fields. Absent on optimistic rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub record_id: i64,
    pub assigned_at_ms: u64,
}

/// One row of a collection view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyRow {
    pub parcel: Arc<Parcel>,
    pub assignment: Option<Assignment>,
}

impl CustodyRow {
    /// Authoritative row as returned by the server.
    pub fn assigned(parcel: Parcel, assignment: Assignment) -> Self {
        Self {
            parcel: Arc::new(parcel),
            assignment: Some(assignment),
        }
    }

    /// Optimistic placeholder, replaced on reconciliation.
    pub fn placeholder(parcel: Arc<Parcel>) -> Self {
        Self {
            parcel,
            assignment: None,
        }
    }

    pub fn tracking_code(&self) -> &TrackingCode {
        &self.parcel.tracking_code
    }

    pub fn is_placeholder(&self) -> bool {
        self.assignment.is_none()
    }
}
