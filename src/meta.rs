//! Free-form catalog metadata.
//!
//! Metadata is a JSON object. The calibration pipeline reads and writes a few
//! well-known keys:
//!
//! - `<prior_key>.<bandpass_id>.zp_delta`: a prior zero-point offset (default key `zp_offset`)
//! - `intercal_reference`: `true` marks a zero-point reference catalog
//! - `intercal.<bandpass_id>`: `{"zp": .., "err": ..}` written by the network solver

use std::fmt;

use serde_json::{json, Map, Value};

use crate::store::BandpassId;

/// Metadata key flagging a zero-point reference catalog.
pub const REFERENCE_KEY: &str = "intercal_reference";

/// Metadata key holding solved zero-points, indexed by bandpass ID.
pub const INTERCAL_KEY: &str = "intercal";

/// Default metadata key of prior zero-point offsets.
pub const DEFAULT_PRIOR_KEY: &str = "zp_offset";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Prior zero-point offset of this catalog in `bandpass`, read from
    /// `meta[prior_key][bandpass_id]["zp_delta"]`. Missing or non-numeric
    /// entries count as zero.
    pub fn prior_zp(&self, prior_key: &str, bandpass: BandpassId) -> f64 {
        self.0
            .get(prior_key)
            .and_then(|v| v.get(bandpass.0.to_string()))
            .and_then(|v| v.get("zp_delta"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Set `meta[prior_key][bandpass_id]["zp_delta"]`.
    pub fn set_prior_zp(&mut self, prior_key: &str, bandpass: BandpassId, zp_delta: f64) {
        update_object(&mut self.0, prior_key, |entry| {
            entry.insert(bandpass.0.to_string(), json!({ "zp_delta": zp_delta }));
        });
    }

    pub fn is_zp_reference(&self) -> bool {
        self.0
            .get(REFERENCE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_zp_reference(&mut self, reference: bool) {
        self.0.insert(REFERENCE_KEY.into(), Value::Bool(reference));
    }

    /// Solved zero-point and uncertainty in `bandpass`, if stored.
    pub fn intercal_zp(&self, bandpass: BandpassId) -> Option<(f64, f64)> {
        let entry = self.0.get(INTERCAL_KEY)?.get(bandpass.0.to_string())?;
        Some((entry.get("zp")?.as_f64()?, entry.get("err")?.as_f64()?))
    }

    /// Store `meta["intercal"][bandpass_id] = {"zp": zp, "err": err}`.
    pub fn set_intercal_zp(&mut self, bandpass: BandpassId, zp: f64, err: f64) {
        update_object(&mut self.0, INTERCAL_KEY, |entry| {
            entry.insert(bandpass.0.to_string(), json!({ "zp": zp, "err": err }));
        });
    }

    /// Encode as a JSON object string.
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Decode from a JSON object string. Non-object JSON is rejected.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<Map<String, Value>>(text).map(Self)
    }
}

/// Apply `f` to the object stored at `key`, replacing any non-object value there.
fn update_object(map: &mut Map<String, Value>, key: &str, f: impl FnOnce(&mut Map<String, Value>)) {
    let mut inner = match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    };
    f(&mut inner);
    map.insert(key.to_string(), Value::Object(inner));
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json())
    }
}
