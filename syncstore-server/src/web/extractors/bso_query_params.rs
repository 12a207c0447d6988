//! `GET .../storage/{collection}` filter-set query string (spec.md §4.1's filter table).

use actix_web::{dev::Payload, web::Query, Error, FromRequest, HttpRequest};
use futures::future::{self, Ready};
use serde::{de::Error as DeError, Deserialize, Deserializer};
use syncstore_db_common::{params::Offset, SyncTimestamp, Sorting};
use validator::Validate;

use super::validation::validate_qs_ids;

fn deserialize_sync_timestamp<'de, D>(deserializer: D) -> Result<Option<SyncTimestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => SyncTimestamp::from_header(&s)
            .map(Some)
            .map_err(DeError::custom),
    }
}

fn deserialize_offset<'de, D>(deserializer: D) -> Result<Option<Offset>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => s.parse::<Offset>().map(Some).map_err(DeError::custom),
    }
}

fn deserialize_sort<'de, D>(deserializer: D) -> Result<Sorting, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(match raw.as_deref() {
        Some("newest") => Sorting::Newest,
        Some("oldest") => Sorting::Oldest,
        Some("index") => Sorting::Index,
        _ => Sorting::None,
    })
}

fn deserialize_comma_sep_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .filter(|s| !s.is_empty())
        .map(|s| s.split(',').map(str::to_owned).collect())
        .unwrap_or_default())
}

/// A query param whose mere presence means "true", regardless of value (`?full` or `?full=1`).
fn deserialize_present_value<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.is_some())
}

#[derive(Clone, Debug, Default, Deserialize, Validate)]
#[serde(default)]
pub struct BsoQueryParams {
    #[serde(deserialize_with = "deserialize_sync_timestamp")]
    pub newer: Option<SyncTimestamp>,
    #[serde(deserialize_with = "deserialize_sync_timestamp")]
    pub older: Option<SyncTimestamp>,
    #[serde(deserialize_with = "deserialize_sort")]
    pub sort: Sorting,
    pub limit: Option<u32>,
    #[serde(deserialize_with = "deserialize_offset")]
    pub offset: Option<Offset>,
    #[serde(deserialize_with = "deserialize_comma_sep_string")]
    #[validate(custom(function = "validate_qs_ids"))]
    pub ids: Vec<String>,
    #[serde(deserialize_with = "deserialize_present_value")]
    pub full: bool,
}

impl FromRequest for BsoQueryParams {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        future::ready(
            Query::<Self>::from_query(req.query_string())
                .map(|q| q.into_inner())
                .map_err(Into::into),
        )
    }
}
