//! Request envelope — autoscaler auth data and payload extraction
//!
//! Every admitted request carries an [`AuthData`] envelope issued by the
//! autoscaler alongside the opaque backend payload. Body-carrying methods
//! (POST/PUT/PATCH) wrap both in a JSON object; bodyless methods
//! (GET/DELETE/HEAD) pass the envelope as `serverless_*` query parameters
//! and everything else through as payload.

use serde_json::{Map, Value};

/// Per-request routing/authorization envelope issued by the autoscaler.
///
/// `cost` keeps its original JSON form (string or number): the signature
/// covers the exact encoding the autoscaler produced, so normalizing it
/// would break verification.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthData {
    /// Workload units assigned to this request
    pub cost: Value,
    /// Target path on the backend
    pub endpoint: String,
    /// Monotonic autoscaler-assigned sequence number
    pub reqnum: i64,
    /// Autoscaler request slot index
    pub request_idx: i64,
    /// Base64 PKCS#1 v1.5 signature over the canonical envelope
    pub signature: String,
    /// This worker's externally-visible URL, echoed for signature binding
    pub url: String,
}

impl AuthData {
    /// Synthetic envelope for unsecured passthrough requests.
    pub fn passthrough(request_path: &str) -> Self {
        Self {
            cost: Value::String("1.0".to_string()),
            endpoint: request_path.to_string(),
            reqnum: 0,
            request_idx: 0,
            signature: String::new(),
            url: String::new(),
        }
    }

    /// Workload units as a float, however the autoscaler encoded them.
    pub fn workload(&self) -> Option<f64> {
        match &self.cost {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Build from a JSON object, collecting a field→reason map on failure.
    fn from_json(obj: &Map<String, Value>) -> std::result::Result<Self, Map<String, Value>> {
        let mut errors = Map::new();
        for field in ["cost", "endpoint", "reqnum", "request_idx", "signature", "url"] {
            if !obj.contains_key(field) {
                errors.insert(field.to_string(), Value::from("missing parameter"));
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let string_field = |name: &str, errors: &mut Map<String, Value>| -> String {
            match obj.get(name).and_then(Value::as_str) {
                Some(s) => s.to_string(),
                None => {
                    errors.insert(name.to_string(), Value::from("expected a string"));
                    String::new()
                }
            }
        };
        let int_field = |name: &str, errors: &mut Map<String, Value>| -> i64 {
            match obj.get(name).and_then(Value::as_i64) {
                Some(n) => n,
                None => {
                    errors.insert(name.to_string(), Value::from("expected an integer"));
                    0
                }
            }
        };

        let endpoint = string_field("endpoint", &mut errors);
        let signature = string_field("signature", &mut errors);
        let url = string_field("url", &mut errors);
        let reqnum = int_field("reqnum", &mut errors);
        let request_idx = int_field("request_idx", &mut errors);
        let cost = obj.get("cost").cloned().unwrap_or(Value::Null);

        let auth = Self {
            cost,
            endpoint,
            reqnum,
            request_idx,
            signature,
            url,
        };
        if auth.workload().is_none() {
            errors.insert("cost".to_string(), Value::from("expected a number"));
        }
        if errors.is_empty() {
            Ok(auth)
        } else {
            Err(errors)
        }
    }
}

/// Envelope validation failure, rendered as a 422 response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The request body was not JSON at all
    InvalidJson,
    /// Field-level problems, keyed by field name
    Fields(Map<String, Value>),
}

impl ValidationError {
    /// JSON body returned to the caller.
    pub fn to_body(&self) -> Value {
        match self {
            Self::InvalidJson => serde_json::json!({"error": "invalid JSON"}),
            Self::Fields(map) => Value::Object(map.clone()),
        }
    }

    fn single(field: &str, reason: &str) -> Self {
        let mut map = Map::new();
        map.insert(field.to_string(), Value::from(reason));
        Self::Fields(map)
    }
}

/// Parse a JSON request body into `(auth_data, payload)`.
///
/// In unsecured mode a body without an `auth_data` field is treated as the
/// payload itself, with a synthetic envelope covering the metrics bookkeeping.
pub fn parse_body(
    body: &[u8],
    request_path: &str,
    unsecured: bool,
) -> std::result::Result<(AuthData, Value), ValidationError> {
    let data: Value = serde_json::from_slice(body).map_err(|_| ValidationError::InvalidJson)?;
    let obj = match data.as_object() {
        Some(obj) => obj,
        None => return Err(ValidationError::InvalidJson),
    };

    if unsecured && !obj.contains_key("auth_data") {
        tracing::debug!("passthrough mode: treating entire request as payload");
        return Ok((AuthData::passthrough(request_path), data.clone()));
    }

    let mut errors = Map::new();
    let auth = match obj.get("auth_data") {
        Some(Value::Object(auth_obj)) => match AuthData::from_json(auth_obj) {
            Ok(auth) => Some(auth),
            Err(field_errors) => {
                errors.insert("auth_data".to_string(), Value::Object(field_errors));
                None
            }
        },
        Some(_) => {
            errors.insert("auth_data".to_string(), Value::from("expected an object"));
            None
        }
        None => {
            errors.insert("auth_data".to_string(), Value::from("field missing"));
            None
        }
    };
    let payload = match obj.get("payload") {
        Some(payload) => Some(payload.clone()),
        None => {
            errors.insert("payload".to_string(), Value::from("field missing"));
            None
        }
    };

    match (auth, payload) {
        (Some(auth), Some(payload)) if errors.is_empty() => Ok((auth, payload)),
        _ => Err(ValidationError::Fields(errors)),
    }
}

/// Parse a bodyless request's query string into `(auth_data, payload)`.
///
/// Envelope fields arrive prefixed `serverless_`; every unprefixed parameter
/// becomes a payload entry. `cost` is re-read as a JSON number when it parses
/// as one, since the query string erases the type the autoscaler signed.
pub fn parse_query(query: &str) -> std::result::Result<(AuthData, Value), ValidationError> {
    let mut envelope: Map<String, Value> = Map::new();
    let mut payload = Map::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if let Some(field) = key.strip_prefix("serverless_") {
            envelope.insert(field.to_string(), Value::from(value.as_ref()));
        } else {
            payload.insert(key.to_string(), Value::from(value.as_ref()));
        }
    }

    let mut errors = Map::new();
    for field in ["cost", "endpoint", "reqnum", "request_idx", "signature", "url"] {
        if !envelope.contains_key(field) {
            errors.insert(
                format!("serverless_{field}"),
                Value::from("missing parameter"),
            );
        }
    }
    if !errors.is_empty() {
        return Err(ValidationError::Fields(errors));
    }

    let int_param = |name: &str| -> std::result::Result<i64, ValidationError> {
        envelope
            .get(name)
            .and_then(Value::as_str)
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| ValidationError::single(&format!("serverless_{name}"), "expected an integer"))
    };
    let str_param = |name: &str| -> String {
        envelope
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let cost_raw = str_param("cost");
    let cost = match serde_json::from_str::<Value>(&cost_raw) {
        Ok(Value::Number(n)) => Value::Number(n),
        _ => Value::String(cost_raw),
    };

    let auth = AuthData {
        cost,
        endpoint: str_param("endpoint"),
        reqnum: int_param("reqnum")?,
        request_idx: int_param("request_idx")?,
        signature: str_param("signature"),
        url: str_param("url"),
    };
    if auth.workload().is_none() {
        return Err(ValidationError::single("serverless_cost", "expected a number"));
    }
    Ok((auth, Value::Object(payload)))
}
