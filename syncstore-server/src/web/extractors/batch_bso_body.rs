//! One entry of the JSON array posted to `POST .../storage/{collection}` (spec.md §4.1), and its
//! batch-upload counterpart (SPEC_FULL.md §4.1 supplement).

use serde_json::Value;
use syncstore_db_common::params::PostCollectionBso;

use super::validation::{validate_body_bso_id, validate_body_bso_sortindex, validate_body_bso_ttl};

#[derive(Clone, Debug, Default)]
pub struct BatchBsoBody {
    pub id: String,
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    pub ttl: Option<u32>,
}

const ALLOWED_KEYS: [&str; 6] = ["id", "sortindex", "payload", "ttl", "modified", "collection"];

impl BatchBsoBody {
    /// Parses and validates one raw JSON value from a POSTed array/newline stream. Returns a
    /// human-readable reason on failure rather than an `ApiError`: the caller (`BsoBodies`)
    /// collects these per-record, it doesn't fail the whole request.
    pub fn from_raw_bso(val: Value) -> Result<BatchBsoBody, String> {
        let map = val.as_object().ok_or_else(|| "invalid json".to_owned())?;
        for key in map.keys() {
            if !ALLOWED_KEYS.contains(&key.as_str()) {
                return Err(format!("unknown field {}", key));
            }
        }

        let id = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| "invalid id".to_owned())?
            .to_owned();
        validate_body_bso_id(&id).map_err(|_| "invalid id".to_owned())?;

        let sortindex = match map.get("sortindex") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = v.as_i64().ok_or_else(|| "invalid sortindex".to_owned())? as i32;
                validate_body_bso_sortindex(n).map_err(|_| "invalid sortindex".to_owned())?;
                Some(n)
            }
        };

        let payload = match map.get("payload") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| "invalid payload".to_owned())?
                    .to_owned(),
            ),
        };

        let ttl = match map.get("ttl") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = v.as_u64().ok_or_else(|| "invalid ttl".to_owned())? as u32;
                validate_body_bso_ttl(n).map_err(|_| "invalid ttl".to_owned())?;
                Some(n)
            }
        };

        Ok(BatchBsoBody {
            id,
            sortindex,
            payload,
            ttl,
        })
    }
}

impl From<BatchBsoBody> for PostCollectionBso {
    fn from(bso: BatchBsoBody) -> Self {
        PostCollectionBso {
            id: bso.id,
            sortindex: bso.sortindex,
            payload: bso.payload,
            ttl: bso.ttl,
        }
    }
}
